//! Contact store reached over the lead store's JSON HTTP API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `GET  /contacts/{id}`: snapshot
//! - `PUT  /contacts/{id}/status`: `{"outreachStatus": "..."}`
//! - `POST /contacts/{id}/lists`: `{"list": "..."}`
//! - `POST /contacts/{id}/tags`: `{"tags": [...]}`

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::collaborators::ContactStore;
use crate::contact::{ContactSnapshot, OutreachStatus};
use crate::error::ContactStoreError;

pub struct HttpContactStore {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpContactStore {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, contact_id: &str, suffix: &str) -> String {
        format!("{}/contacts/{contact_id}{suffix}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn write(
        &self,
        request: reqwest::RequestBuilder,
        contact_id: &str,
    ) -> Result<(), ContactStoreError> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ContactStoreError::Request(e.to_string()))?;
        check_status(resp.status(), contact_id)?;
        Ok(())
    }
}

fn check_status(status: StatusCode, contact_id: &str) -> Result<(), ContactStoreError> {
    if status == StatusCode::NOT_FOUND {
        return Err(ContactStoreError::NotFound {
            contact_id: contact_id.to_string(),
        });
    }
    if !status.is_success() {
        return Err(ContactStoreError::Request(format!(
            "contact {contact_id}: lead store returned {status}"
        )));
    }
    Ok(())
}

#[async_trait]
impl ContactStore for HttpContactStore {
    async fn get_snapshot(&self, contact_id: &str) -> Result<ContactSnapshot, ContactStoreError> {
        let resp = self
            .authorized(self.client.get(self.url(contact_id, "")))
            .send()
            .await
            .map_err(|e| ContactStoreError::Request(e.to_string()))?;
        check_status(resp.status(), contact_id)?;

        resp.json::<ContactSnapshot>()
            .await
            .map_err(|e| ContactStoreError::Request(format!("contact {contact_id}: {e}")))
    }

    async fn set_outreach_status(
        &self,
        contact_id: &str,
        status: OutreachStatus,
    ) -> Result<(), ContactStoreError> {
        let body = serde_json::json!({ "outreachStatus": status });
        self.write(
            self.client.put(self.url(contact_id, "/status")).json(&body),
            contact_id,
        )
        .await
    }

    async fn add_to_list(&self, contact_id: &str, list: &str) -> Result<(), ContactStoreError> {
        let body = serde_json::json!({ "list": list });
        self.write(
            self.client.post(self.url(contact_id, "/lists")).json(&body),
            contact_id,
        )
        .await
    }

    async fn add_tags(
        &self,
        contact_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<(), ContactStoreError> {
        let body = serde_json::json!({ "tags": tags });
        self.write(
            self.client.post(self.url(contact_id, "/tags")).json(&body),
            contact_id,
        )
        .await
    }
}
