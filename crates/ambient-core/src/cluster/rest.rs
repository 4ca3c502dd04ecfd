//! Kubernetes REST implementation of `ClusterClient`

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    AgenticSession, ClusterClient, Namespace, RoleBinding, SESSION_API_GROUP, SESSION_API_VERSION,
};
use crate::config::KubeConfig;
use crate::error::ClusterError;

pub struct KubeRestClient {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// The `Status` object the API server returns on failures.
#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

impl KubeRestClient {
    /// Build from config: explicit token, else the mounted service-account
    /// token; the CA bundle is trusted when the file exists.
    pub fn from_config(config: &KubeConfig) -> Result<Self, ClusterError> {
        let server = config
            .api_server
            .as_deref()
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ClusterError::Setup(
                    "no API server configured and not running in a cluster".to_string(),
                )
            })?;

        let token = match &config.token {
            Some(token) => Some(token.clone()),
            None if config.token_file.exists() => {
                let token = std::fs::read_to_string(&config.token_file).map_err(|e| {
                    ClusterError::Setup(format!(
                        "failed to read token file {}: {e}",
                        config.token_file.display()
                    ))
                })?;
                Some(token.trim().to_string())
            }
            None => None,
        };

        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());
        if config.ca_file.exists() {
            let pem = std::fs::read(&config.ca_file).map_err(|e| {
                ClusterError::Setup(format!(
                    "failed to read CA file {}: {e}",
                    config.ca_file.display()
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClusterError::Setup(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if config.insecure_skip_tls_verify {
            tracing::warn!("TLS verification disabled for the cluster API");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            server,
            token,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
        query: &[(&str, &str)],
    ) -> Result<Response, ClusterError> {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.server, path));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, path))
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let response = self.send(Method::GET, path, None::<&()>, &[]).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    async fn write<T: Serialize + DeserializeOwned + Sync>(
        &self,
        method: Method,
        path: &str,
        object: &T,
    ) -> Result<T, ClusterError> {
        let response = self.send(method, path, Some(object), &[]).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    async fn remove(&self, path: &str) -> Result<(), ClusterError> {
        self.send(Method::DELETE, path, None::<&()>, &[]).await?;
        Ok(())
    }
}

fn status_error(status: StatusCode, body: &str, path: &str) -> ClusterError {
    let message = serde_json::from_str::<StatusBody>(body)
        .ok()
        .map(|s| s.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound(path.to_string()),
        StatusCode::CONFLICT => ClusterError::Conflict(message),
        _ => ClusterError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

fn namespaces_path() -> String {
    "/api/v1/namespaces".to_string()
}

fn namespace_path(name: &str) -> String {
    format!("/api/v1/namespaces/{name}")
}

fn role_bindings_path(namespace: &str) -> String {
    format!("/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings")
}

fn agentic_sessions_path(namespace: &str) -> String {
    format!("/apis/{SESSION_API_GROUP}/{SESSION_API_VERSION}/namespaces/{namespace}/agenticsessions")
}

#[async_trait]
impl ClusterClient for KubeRestClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        self.read(&namespace_path(name)).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        self.write(Method::POST, &namespaces_path(), namespace).await
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        self.write(Method::PUT, &namespace_path(&namespace.metadata.name), namespace)
            .await
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RoleBinding, ClusterError> {
        self.read(&format!("{}/{name}", role_bindings_path(namespace)))
            .await
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, ClusterError> {
        let response = self
            .send(
                Method::GET,
                &role_bindings_path(namespace),
                None::<&()>,
                &[("labelSelector", label_selector)],
            )
            .await?;
        let list: ObjectList<RoleBinding> = serde_json::from_slice(&response.bytes().await?)?;
        Ok(list.items)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError> {
        self.write(
            Method::POST,
            &role_bindings_path(binding.metadata.namespace()),
            binding,
        )
        .await
    }

    async fn update_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, ClusterError> {
        let path = format!(
            "{}/{}",
            role_bindings_path(binding.metadata.namespace()),
            binding.metadata.name
        );
        self.write(Method::PUT, &path, binding).await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.remove(&format!("{}/{name}", role_bindings_path(namespace)))
            .await
    }

    async fn get_agentic_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AgenticSession, ClusterError> {
        self.read(&format!("{}/{name}", agentic_sessions_path(namespace)))
            .await
    }

    async fn create_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError> {
        self.write(
            Method::POST,
            &agentic_sessions_path(session.metadata.namespace()),
            session,
        )
        .await
    }

    async fn update_agentic_session(
        &self,
        session: &AgenticSession,
    ) -> Result<AgenticSession, ClusterError> {
        let path = format!(
            "{}/{}",
            agentic_sessions_path(session.metadata.namespace()),
            session.metadata.name
        );
        self.write(Method::PUT, &path, session).await
    }

    async fn delete_agentic_session(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.remove(&format!("{}/{name}", agentic_sessions_path(namespace)))
            .await
    }
}
