//! Opens authenticated IMAP sessions for accounts

use super::session::ImapSession;
use super::tls::{create_tls_connector, server_name};
use crate::mailbox::{Connector, MailboxSession};
use async_trait::async_trait;
use mailjudge_common::config::ImapConfig;
use mailjudge_common::types::Account;
use mailjudge_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// TCP/TLS connector producing selected [`ImapSession`]s
pub struct ImapConnector {
    config: ImapConfig,
    commit_threshold: usize,
    tls: Option<TlsConnector>,
}

impl ImapConnector {
    /// Create a connector; trusted roots are loaded once when TLS is on
    pub fn new(config: ImapConfig, commit_threshold: usize) -> Result<Self> {
        let tls = if config.secure {
            Some(create_tls_connector(&config.ca_file)?)
        } else {
            None
        };
        Ok(Self {
            config,
            commit_threshold,
            tls,
        })
    }

    /// Greet, log in and select on an established stream. The session is
    /// closed before any failure is returned.
    pub async fn open<S>(&self, stream: S, account: &Account, password: &str) -> Result<Box<dyn MailboxSession>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = ImapSession::new(
            stream,
            account.user.clone(),
            self.config.command_timeout(),
            self.commit_threshold,
        )
        .with_max_literal(self.config.max_literal_bytes);

        let handshake = async {
            session.read_greeting().await?;
            session.login(password).await?;
            session.select(account.folder()).await
        };

        let outcome = timeout(self.config.connect_timeout(), handshake).await;
        match outcome {
            Ok(Ok(())) => {
                info!(user = %account.user, folder = %account.folder(), "Session established");
                Ok(Box::new(session))
            }
            Ok(Err(e)) => {
                let _ = session.close().await;
                Err(e)
            }
            Err(_) => {
                let err = session.broken("login timed out");
                let _ = session.close().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>> {
        let password = account
            .credential
            .as_ref()
            .ok_or_else(|| Error::Auth(format!("No password set for {}", account.user)))?;

        let (host, port) = account.endpoint(self.config.secure);
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        debug!(user = %account.user, addr = %addr, secure = self.config.secure, "Connecting");

        let stream = timeout(self.config.connect_timeout(), TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::Disconnected(format!("Connection timeout to {}", addr)))?
            .map_err(|e| Error::Disconnected(format!("Failed to connect to {}: {}", addr, e)))?;

        match &self.tls {
            Some(connector) => {
                let name = server_name(&host)?;
                let stream = timeout(self.config.connect_timeout(), connector.connect(name, stream))
                    .await
                    .map_err(|_| Error::Disconnected(format!("TLS handshake timeout with {}", addr)))?
                    .map_err(|e| Error::Disconnected(format!("TLS error with {}: {}", addr, e)))?;
                self.open(stream, account, password.expose()).await
            }
            None => self.open(stream, account, password.expose()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailjudge_common::types::Credential;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn plain_config() -> ImapConfig {
        ImapConfig {
            secure: false,
            ..ImapConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_credential_is_auth_error() {
        let connector = ImapConnector::new(plain_config(), 25).unwrap();
        let account = Account::new("alice@example.com", "127.0.0.1:1");
        let err = connector.connect(&account).await.err().unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_open_failure_closes_session() {
        let connector = ImapConnector::new(plain_config(), 25).unwrap();
        let account = Account::new("alice@example.com", "imap.example.com")
            .with_folder(Some("Lists".to_string()))
            .with_credential(Credential::new("secret"));

        let (client, server) = duplex(4096);
        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server.write_all(b"* OK ready\r\n").await.unwrap();

            let mut commands = Vec::new();
            let mut line = String::new();
            while server.read_line(&mut line).await.unwrap() > 0 {
                let (tag, command) = line.trim_end().split_once(' ').unwrap();
                let reply = if command.starts_with("SELECT") {
                    format!("{} NO no such folder\r\n", tag)
                } else {
                    format!("{} OK done\r\n", tag)
                };
                commands.push(command.split(' ').next().unwrap().to_string());
                server.write_all(reply.as_bytes()).await.unwrap();
                line.clear();
            }
            commands
        });

        let err = connector
            .open(client, &account, "secret")
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "PROTOCOL_ERROR");

        let commands = server.await.unwrap();
        assert_eq!(commands, vec!["LOGIN", "SELECT", "LOGOUT"]);
    }

    #[test]
    fn test_secure_connector_needs_ca_file() {
        let config = ImapConfig {
            secure: true,
            ca_file: "/nonexistent/ca.pem".into(),
            ..ImapConfig::default()
        };
        assert!(ImapConnector::new(config, 25).is_err());
    }
}
