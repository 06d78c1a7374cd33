use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;
use uuid::Uuid;

use warden_shared::{Error, Result, Traffic};

use crate::config::{Config, EnvironmentConfig};
use crate::services::proxy_proto as proto;
use crate::services::Service;

const FLOW: &str = "xtls-rprx-vision";

/// Adapter for the proxy data plane's gRPC management API over its UNIX
/// socket. The channel is lazy, so constructing the adapter performs no
/// I/O; it must only be constructed in the process that will use it.
pub struct ProxyService {
    channel: Channel,
    timeout: Duration,
    domain: String,
    inbounds: Vec<String>,
}

impl ProxyService {
    pub fn new(config: &Config) -> Result<Self> {
        let socket_path = config.main.proxy_api_socket_path.clone();
        // The authority is a placeholder; every connection goes through
        // the UNIX socket connector.
        let channel = Endpoint::from_static("http://proxy.api").connect_with_connector_lazy(
            service_fn(move |_: Uri| {
                let socket_path: PathBuf = socket_path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket_path).await?))
                }
            }),
        );
        Ok(Self {
            channel,
            timeout: Duration::from_secs(config.main.service_timeout),
            domain: config.environment.domain.clone(),
            inbounds: config.main.proxy_inbounds.clone(),
        })
    }

    fn email(&self, username: &str) -> String {
        format!("{}@{}", username, self.domain)
    }

    fn map_status(status: tonic::Status, username: &str) -> Error {
        let details = status.message().to_lowercase();
        if details.contains("already exists") {
            Error::UserExist(username.to_owned())
        } else if details.contains("not found") {
            Error::UserNotExist(username.to_owned())
        } else if details.contains("no such file or directory")
            || details.contains("connection refused")
            || matches!(
                status.code(),
                tonic::Code::DeadlineExceeded | tonic::Code::Unavailable
            )
        {
            Error::ProxyTimeout
        } else {
            Error::Unexpected(format!("proxy management call failed: {status}"))
        }
    }

    async fn alter_inbound(&self, tag: &str, operation: proto::TypedMessage, username: &str) -> Result<()> {
        let request = proto::AlterInboundRequest {
            tag: tag.to_owned(),
            operation: Some(operation),
        };
        let call = async {
            let mut grpc = Grpc::new(self.channel.clone());
            grpc.ready().await.map_err(|_| Error::ProxyTimeout)?;
            let codec: ProstCodec<proto::AlterInboundRequest, proto::AlterInboundResponse> =
                ProstCodec::default();
            grpc.unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(proto::ALTER_INBOUND_PATH),
                codec,
            )
            .await
            .map_err(|status| Self::map_status(status, username))
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::ProxyTimeout)??;
        Ok(())
    }

    async fn query_stats(&self, pattern: &str, reset: bool) -> Result<proto::QueryStatsResponse> {
        let request = proto::QueryStatsRequest {
            pattern: pattern.to_owned(),
            reset,
        };
        let call = async {
            let mut grpc = Grpc::new(self.channel.clone());
            grpc.ready().await.map_err(|_| Error::ProxyTimeout)?;
            let codec: ProstCodec<proto::QueryStatsRequest, proto::QueryStatsResponse> =
                ProstCodec::default();
            grpc.unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(proto::QUERY_STATS_PATH),
                codec,
            )
            .await
            .map_err(|status| Self::map_status(status, ""))
        };
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::ProxyTimeout)??;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl Service for ProxyService {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn alias(&self) -> &'static str {
        "proxy server"
    }

    // The proxy core keeps reporting counters for deleted users.
    fn reports_stale_traffic(&self) -> bool {
        true
    }

    fn timeout_error(&self) -> Error {
        Error::ProxyTimeout
    }

    async fn add_user(&self, username: &str, uuid: &Uuid) -> Result<()> {
        let account = proto::typed(
            proto::Account::TYPE_NAME,
            &proto::Account {
                id: uuid.to_string(),
                flow: FLOW.to_owned(),
                encryption: String::new(),
            },
        );
        let operation = proto::typed(
            proto::AddUserOperation::TYPE_NAME,
            &proto::AddUserOperation {
                user: Some(proto::User {
                    level: 0,
                    email: self.email(username),
                    account: Some(account),
                }),
            },
        );
        for tag in &self.inbounds {
            self.alter_inbound(tag, operation.clone(), username).await?;
        }
        debug!("user '{username}' is added to the proxy");
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let operation = proto::typed(
            proto::RemoveUserOperation::TYPE_NAME,
            &proto::RemoveUserOperation {
                email: self.email(username),
            },
        );
        for tag in &self.inbounds {
            self.alter_inbound(tag, operation.clone(), username).await?;
        }
        debug!("user '{username}' is deleted from the proxy");
        Ok(())
    }

    async fn users_traffic_usage(&self, reset: bool) -> Result<HashMap<String, Traffic>> {
        let mut stats: HashMap<String, Traffic> = HashMap::new();
        for stat in self.query_stats("user", reset).await?.stat {
            // Stat names look like `user>>>alice@example.com>>>traffic>>>uplink`.
            let mut sections = stat.name.split(">>>");
            let Some(email) = sections.nth(1) else {
                continue;
            };
            let username = email.split('@').next().unwrap_or(email).to_owned();
            let entry = stats.entry(username).or_default();
            match sections.last() {
                Some("uplink") => entry.uplink += stat.value,
                Some("downlink") => entry.downlink += stat.value,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Renders the client-configuration URLs for the given account id.
pub fn subscription_urls(environment: &EnvironmentConfig, uuid: &Uuid) -> String {
    format!(
        "vless://{uuid}@{sni}:{port}?security=tls&fp=randomized&type=tcp&flow={FLOW}#{domain}\n",
        sni = environment.proxy_sni,
        port = environment.tls_port,
        domain = environment.domain,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_names_parse_into_per_user_traffic() {
        let response = proto::QueryStatsResponse {
            stat: vec![
                proto::Stat {
                    name: "user>>>alice@example.com>>>traffic>>>uplink".into(),
                    value: 700,
                },
                proto::Stat {
                    name: "user>>>alice@example.com>>>traffic>>>downlink".into(),
                    value: 600,
                },
                proto::Stat {
                    name: "user>>>bob@example.com>>>traffic>>>uplink".into(),
                    value: 5,
                },
            ],
        };
        let mut stats: HashMap<String, Traffic> = HashMap::new();
        for stat in response.stat {
            let mut sections = stat.name.split(">>>");
            let email = sections.nth(1).unwrap();
            let username = email.split('@').next().unwrap().to_owned();
            let entry = stats.entry(username).or_default();
            match sections.last() {
                Some("uplink") => entry.uplink += stat.value,
                Some("downlink") => entry.downlink += stat.value,
                _ => {}
            }
        }
        assert_eq!(stats["alice"], Traffic { uplink: 700, downlink: 600 });
        assert_eq!(stats["bob"], Traffic { uplink: 5, downlink: 0 });
    }

    #[test]
    fn subscription_url_contains_the_account_id() {
        let environment = EnvironmentConfig {
            domain: "example.com".into(),
            tls_port: "443".into(),
            proxy_sni: "cdn.example.com".into(),
        };
        let uuid = Uuid::new_v4();
        let url = subscription_urls(&environment, &uuid);
        assert!(url.starts_with(&format!("vless://{uuid}@cdn.example.com:443?")));
        assert!(url.trim_end().ends_with("#example.com"));
    }
}
