use clap::Parser;
use std::path::PathBuf;

use commentcap_lib::config::CaptureConfig;

/// Capture comments from the tracked site through a debuggable browser
#[derive(Parser, Debug)]
#[command(name = "commentcap", version, about)]
struct Args {
    /// Config file (defaults to <config dir>/commentcap/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// DevTools HTTP endpoint, e.g. http://127.0.0.1:9222
    #[arg(long)]
    devtools_url: Option<String>,

    /// Address for the UI server
    #[arg(short, long)]
    bind: Option<String>,

    /// Site whose tabs are captured
    #[arg(long)]
    tracked_host: Option<String>,

    /// Start with page-down scrolling enabled on new sessions
    #[arg(long)]
    scroll: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut CaptureConfig) {
        if let Some(url) = self.devtools_url {
            config.browser.devtools_url = url;
        }
        if let Some(bind) = self.bind {
            config.web.bind = bind;
        }
        if let Some(host) = self.tracked_host {
            config.capture.tracked_host = host;
        }
        if self.scroll {
            config.scroll.enabled_by_default = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let mut config = CaptureConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    commentcap_lib::run(config).await
}
