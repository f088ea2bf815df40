//! SSH transport built on russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CommandOutput, Stdin, Transport};
use crate::config::Credentials;
use crate::{Error, Result};

/// Default time allowed to establish and authenticate a session
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Accepts any host key; nodes are addressed by the operator's own inventory
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated SSH connection; every command gets its own channel
pub struct SshTransport {
    target: String,
    handle: Mutex<Handle<ClientHandler>>,
}

impl SshTransport {
    /// Connect and authenticate as `user`
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let target = format!("{}:{}", host, port);
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            connect_timeout,
            client::connect(config, (host.to_string(), port), ClientHandler),
        )
        .await
        .map_err(|_| Error::connection(&target, format!("connect timed out after {:?}", connect_timeout)))?
        .map_err(|e| Error::connection(&target, e.to_string()))?;

        let authenticated = match credentials {
            Credentials::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| Error::connection(&target, e.to_string()))?,
            Credentials::PrivateKey(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    Error::connection(
                        &target,
                        format!("cannot load private key {}: {}", path.display(), e),
                    )
                })?;
                handle
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| Error::connection(&target, e.to_string()))?
            }
        };
        if !authenticated {
            return Err(Error::connection(&target, format!("authentication as {} rejected", user)));
        }

        info!(target = %target, user = %user, "ssh session established");
        Ok(Self {
            target,
            handle: Mutex::new(handle),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str, stdin: Option<Stdin>) -> Result<CommandOutput> {
        let mut channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| Error::connection(&self.target, e.to_string()))?
        };
        let transport_err = |e: russh::Error| Error::connection(&self.target, e.to_string());

        channel.exec(true, command).await.map_err(transport_err)?;
        match stdin {
            Some(Stdin::Bytes(bytes)) => {
                channel.data(&bytes[..]).await.map_err(transport_err)?;
            }
            Some(Stdin::File(path)) => {
                let file = tokio::fs::File::open(&path).await?;
                channel.data(file).await.map_err(transport_err)?;
            }
            None => {}
        }
        channel.eof().await.map_err(transport_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        debug!(target = %self.target, command = %command, exit_status = ?exit_status, "command finished");
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(target = %self.target, error = %e, "ssh disconnect failed");
            return;
        }
        debug!(target = %self.target, "ssh session closed");
    }
}
