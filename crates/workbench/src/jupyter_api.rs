//! REST client for a Jupyter server: notebook contents and kernel lifecycle.

use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use url::Url;

use crate::notebook_state::Notebook;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Persistence sink for notebook snapshots.
pub trait ContentStore: Send + Sync {
    /// Replace the stored document at `path`.
    fn save_notebook(
        &self,
        path: &str,
        document: Value,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Entry from the contents API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentModel {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
}

/// Running kernel, as reported by the kernels API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

#[derive(Clone)]
pub struct JupyterClient {
    http: Client,
    base_url: Url,
    username: String,
    token: Option<String>,
}

impl JupyterClient {
    pub fn new(
        server_url: &str,
        username: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(server_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            username: username.into(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn api_url(&self, rest: &str) -> Result<Url, ApiError> {
        let path = format!("user/{}/api/{}", self.username, rest.trim_start_matches('/'));
        Ok(self.base_url.join(&path)?)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder
                .query(&[("token", token)])
                .header(AUTHORIZATION, format!("token {token}"));
        }
        builder
    }

    async fn send(
        &self,
        method: Method,
        rest: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.api_url(rest)?;
        let path = url.path().to_string();
        debug!("[jupyter-api] {} {}", method, path);

        let mut builder = self.request(method.clone(), url);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let res = builder.send().await?;

        if res.status().is_success() {
            Ok(res)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::Status {
                method,
                path,
                status,
                body,
            })
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        rest: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        Ok(self.send(method, rest, body).await?.json::<T>().await?)
    }

    /// Create an empty notebook named `{name}.ipynb`.
    pub async fn create_notebook(&self, name: &str) -> Result<ContentModel, ApiError> {
        let path = if name.ends_with(".ipynb") {
            name.to_string()
        } else {
            format!("{name}.ipynb")
        };
        let body = json!({
            "type": "notebook",
            "content": {
                "cells": [],
                "metadata": {},
                "nbformat": 4,
                "nbformat_minor": 5,
            },
        });
        let model: ContentModel = self
            .send_json(Method::PUT, &format!("contents/{path}"), Some(body))
            .await?;
        info!("[jupyter-api] Created notebook {}", model.path);
        Ok(model)
    }

    /// Notebooks in the root directory.
    pub async fn list_notebooks(&self) -> Result<Vec<ContentModel>, ApiError> {
        let listing: ContentModel = self.send_json(Method::GET, "contents", None).await?;
        notebook_entries(listing)
    }

    pub async fn get_notebook(&self, path: &str) -> Result<ContentModel, ApiError> {
        self.send_json(Method::GET, &format!("contents/{path}"), None)
            .await
    }

    /// Fetch a notebook and build the aggregate from its document.
    pub async fn load_notebook(&self, path: &str) -> anyhow::Result<Notebook> {
        let model = self.get_notebook(path).await?;
        let document = model
            .content
            .ok_or_else(|| anyhow::anyhow!("{} has no content", path))?;
        Ok(Notebook::from_document(model.name, model.path, &document)?)
    }

    /// Replace the notebook document at `path`.
    pub async fn update_notebook(
        &self,
        path: &str,
        content: Value,
    ) -> Result<ContentModel, ApiError> {
        let body = json!({ "type": "notebook", "content": content });
        self.send_json(Method::PUT, &format!("contents/{path}"), Some(body))
            .await
    }

    pub async fn delete_notebook(&self, path: &str) -> Result<(), ApiError> {
        self.send(Method::DELETE, &format!("contents/{path}"), None)
            .await?;
        info!("[jupyter-api] Deleted notebook {}", path);
        Ok(())
    }

    pub async fn create_kernel(&self, kernel_name: &str) -> Result<KernelModel, ApiError> {
        let kernel: KernelModel = self
            .send_json(Method::POST, "kernels", Some(json!({ "name": kernel_name })))
            .await?;
        info!("[jupyter-api] Started {} kernel {}", kernel.name, kernel.id);
        Ok(kernel)
    }

    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, ApiError> {
        self.send_json(Method::GET, "kernels", None).await
    }

    pub async fn delete_kernel(&self, kernel_id: &str) -> Result<(), ApiError> {
        self.send(Method::DELETE, &format!("kernels/{kernel_id}"), None)
            .await?;
        info!("[jupyter-api] Stopped kernel {}", kernel_id);
        Ok(())
    }

    /// Websocket address of a kernel's channels endpoint.
    pub fn kernel_channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url, ApiError> {
        let mut url = self.api_url(&format!("kernels/{kernel_id}/channels"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always a valid scheme change.
        let _ = url.set_scheme(scheme);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

impl ContentStore for JupyterClient {
    async fn save_notebook(&self, path: &str, document: Value) -> anyhow::Result<()> {
        self.update_notebook(path, document).await?;
        Ok(())
    }
}

/// Notebook entries of a directory listing.
fn notebook_entries(listing: ContentModel) -> Result<Vec<ContentModel>, ApiError> {
    let items: Vec<ContentModel> = match listing.content {
        Some(content) => serde_json::from_value(content)?,
        None => Vec::new(),
    };
    Ok(items.into_iter().filter(|m| m.kind == "notebook").collect())
}
