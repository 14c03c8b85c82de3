//! HTTP client for the `Apps` user service.
//!
//! The builder needs exactly one thing from it: the IP the user last logged
//! in from, which ends up in the `login-ip` label of the analysis pod.

use serde::Deserialize;

use vice_spec::UserInfo;

#[derive(Debug, Deserialize)]
struct UserIpBody {
    ip: String,
}

#[derive(Clone)]
pub struct AppsClient {
    base_url: String,
    http: reqwest::Client,
}

impl AppsClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait::async_trait]
impl UserInfo for AppsClient {
    async fn get_user_ip(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!(
            "{}/users/{user_id}/ip",
            self.base_url.trim_end_matches('/')
        );

        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: UserIpBody = response.error_for_status()?.json().await?;
        Ok(Some(body.ip).filter(|ip| !ip.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    #[tokio::test]
    async fn returns_the_login_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u-1/ip"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ip": "10.0.0.1"})),
            )
            .mount(&server)
            .await;

        let client = AppsClient::new(server.uri(), reqwest::Client::new());
        assert_eq!(
            client.get_user_ip("u-1").await.unwrap(),
            Some("10.0.0.1".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_users_have_no_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u-2/ip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = AppsClient::new(server.uri(), reqwest::Client::new());
        assert_eq!(client.get_user_ip("u-2").await.unwrap(), None);
    }
}
