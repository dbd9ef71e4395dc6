use clap::Parser;

use oproxy_common::Config;

#[derive(Parser)]
#[command(name = "oproxy", about = "OpenAI-compatible gateway over Ollama backends")]
pub(crate) struct Cli {
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    #[arg(long)]
    pub(crate) data_dir: Option<String>,
    /// Default upstream for keys added without a URL of their own.
    #[arg(long)]
    pub(crate) base_url: Option<String>,
}

impl Cli {
    /// CLI flags override env, which overrides defaults.
    pub(crate) fn overlay(self, mut config: Config) -> Config {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(base_url) = self.base_url {
            config.default_base_url = base_url;
        }
        config
    }
}
