//! nginx virtual host management

use tracing::{info, warn};

use crate::deploy::command::{CommandError, CommandRunner, CommandSpec};
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::stream::sink::LogSink;

const VHOST_TEMPLATE: &str = r#"server {
    listen 80;
    listen [::]:80;
    server_name {domain};

    location / {
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }
}
"#;

/// Standalone config used to syntax-check a candidate vhost before it is
/// placed into the active set
const WRAPPER_TEMPLATE: &str = r#"pid {scratch}/nginx.pid;
error_log stderr;

events {}

http {
    access_log off;
    include {candidate};
}
"#;

/// Render the vhost for `domain` proxying to the local `port`
pub fn render_vhost(domain: &str, port: u16) -> String {
    VHOST_TEMPLATE
        .replace("{domain}", domain)
        .replace("{port}", &port.to_string())
}

/// Owns the `sites-available` / `sites-enabled` pair of an nginx install
#[derive(Debug, Clone)]
pub struct ProxyConfigurator {
    nginx: String,
    sites_available: Dir,
    sites_enabled: Dir,
}

impl ProxyConfigurator {
    pub fn new(nginx: impl Into<String>, sites_available: Dir, sites_enabled: Dir) -> Self {
        Self {
            nginx: nginx.into(),
            sites_available,
            sites_enabled,
        }
    }

    pub fn config_file(&self, domain: &str) -> File {
        self.sites_available.file(&format!("{}.conf", domain))
    }

    pub fn link_file(&self, domain: &str) -> File {
        self.sites_enabled.file(&format!("{}.conf", domain))
    }

    /// Write and activate the vhost for `domain`.
    ///
    /// The candidate is syntax-checked on its own first. After it is swapped
    /// in, the whole active set is checked and nginx reloaded; if either
    /// fails the previous file and link are restored.
    pub async fn install(
        &self,
        runner: &dyn CommandRunner,
        domain: &str,
        port: u16,
        sink: &dyn LogSink,
    ) -> Result<(), DeployerError> {
        let contents = render_vhost(domain, port);
        self.validate_candidate(runner, &contents, sink).await?;

        let config = self.config_file(domain);
        let link = self.link_file(domain);
        let previous = config.read_string_opt().await?;
        let link_existed = link.entry_exists().await;

        config.write_atomic(contents.as_bytes()).await?;
        link.link_to(config.path()).await?;
        sink.log(format!("Wrote {}", config.path().display()));

        if let Err(e) = self.test_and_reload(runner, sink).await {
            warn!("Proxy activation for {} failed, restoring previous config: {}", domain, e);
            sink.log("Proxy activation failed, restoring previous config".to_string());
            match previous {
                Some(previous) => config.write_atomic(previous.as_bytes()).await?,
                None => {
                    config.delete().await?;
                }
            }
            if !link_existed {
                link.delete().await?;
            }
            return Err(DeployerError::ProxyError(e.to_string()));
        }

        info!("Proxy for {} now points at port {}", domain, port);
        Ok(())
    }

    /// Remove the vhost and its link, then reload. Returns `false` when there
    /// was nothing to remove.
    pub async fn remove(
        &self,
        runner: &dyn CommandRunner,
        domain: &str,
        sink: &dyn LogSink,
    ) -> Result<bool, DeployerError> {
        let config = self.config_file(domain);
        let link = self.link_file(domain);

        let removed_link = link.delete().await?;
        let removed_config = config.delete().await?;
        if !removed_link && !removed_config {
            return Ok(false);
        }

        self.reload(runner, sink).await?;
        Ok(true)
    }

    pub async fn reload(&self, runner: &dyn CommandRunner, sink: &dyn LogSink) -> Result<(), CommandError> {
        let cmd = CommandSpec::new(&self.nginx).args(["-s", "reload"]);
        sink.log(format!("$ {}", cmd));
        runner.run(&cmd, sink).await?;
        Ok(())
    }

    async fn test_and_reload(&self, runner: &dyn CommandRunner, sink: &dyn LogSink) -> Result<(), CommandError> {
        let cmd = CommandSpec::new(&self.nginx).args(["-t", "-q"]);
        sink.log(format!("$ {}", cmd));
        runner.run(&cmd, sink).await?;
        self.reload(runner, sink).await
    }

    async fn validate_candidate(
        &self,
        runner: &dyn CommandRunner,
        contents: &str,
        sink: &dyn LogSink,
    ) -> Result<(), DeployerError> {
        let scratch = Dir::create_temp_dir("tenant-deployer-vhost").await?;
        let result = self.check_in(&scratch, runner, contents, sink).await;
        if let Err(e) = scratch.delete().await {
            warn!("Failed to remove {}: {}", scratch.path().display(), e);
        }
        result
    }

    async fn check_in(
        &self,
        scratch: &Dir,
        runner: &dyn CommandRunner,
        contents: &str,
        sink: &dyn LogSink,
    ) -> Result<(), DeployerError> {
        let candidate = scratch.file("site.conf");
        candidate.write_string(contents).await?;

        let wrapper = scratch.file("nginx.conf");
        let wrapper_contents = WRAPPER_TEMPLATE
            .replace("{scratch}", &scratch.path().display().to_string())
            .replace("{candidate}", &candidate.path().display().to_string());
        wrapper.write_string(&wrapper_contents).await?;

        let cmd = CommandSpec::new(&self.nginx)
            .args(["-t", "-q", "-p"])
            .arg(scratch.path().display().to_string())
            .arg("-c")
            .arg(wrapper.path().display().to_string());
        sink.log(format!("$ {}", cmd));
        runner
            .run(&cmd, sink)
            .await
            .map_err(|e| DeployerError::ProxyError(format!("generated config is invalid: {}", e)))?;
        Ok(())
    }
}
