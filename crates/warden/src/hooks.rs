//! Reverse-proxy reload after a certificate changes

use async_trait::async_trait;
use tracing::info;

use warden_common::{CommandRunner, ExecError, Fqdn};

/// Makes the reverse proxy pick up a new certificate
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    async fn reload(&self, fqdn: &Fqdn) -> Result<(), ExecError>;
}

/// Runs a configured command line
///
/// The literal argument `{fqdn}` is replaced by the tenant hostname.
#[derive(Debug, Clone)]
pub struct CommandReloader {
    argv: Vec<String>,
    runner: CommandRunner,
}

impl CommandReloader {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            runner: CommandRunner::new(),
        }
    }

    fn command_for(&self, fqdn: &Fqdn) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace("{fqdn}", fqdn.as_str()))
            .collect()
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self, fqdn: &Fqdn) -> Result<(), ExecError> {
        let argv = self.command_for(fqdn);
        self.runner.execute_checked(&argv).await?;
        info!(domain = %fqdn, command = ?argv, "Reverse proxy reloaded");
        Ok(())
    }
}
