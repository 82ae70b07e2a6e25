use clap::{Parser, Subcommand};
use eyre::Context;
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use youtube_publisher::acquire::LocalUpload;
use youtube_publisher::pipeline::PipelineEvent;
use youtube_publisher::{Config, PipelineOutcome, Publisher, RequesterId};

/// Publish videos to YouTube from the command line.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show which credential is in use and the channel it belongs to.
    AuthStatus,
    /// Authorize through the browser and store the resulting token.
    Authorize,
    /// Print a consent URL for authorizing on another device.
    AuthUrl,
    /// Finish authorizing with the code shown after visiting the consent URL.
    ExchangeCode { code: String },
    /// Publish a local video file.
    File {
        path: PathBuf,
        /// Duration in seconds, checked against the configured limit before uploading.
        #[arg(long)]
        duration: Option<u64>,
        /// Title to publish under instead of the file name.
        #[arg(long)]
        title: Option<String>,
    },
    /// Download a video from another site and publish it.
    Url { url: String },
}

fn requester() -> RequesterId {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map(RequesterId::from)
        .unwrap_or_else(|_| RequesterId::from("cli"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("load configuration")?;
    let publisher = Publisher::from_config(&config)
        .await
        .context("set up publisher")?;

    match cli.command {
        Command::AuthStatus => auth_status(&publisher).await,
        Command::Authorize => {
            let oauth = publisher.oauth().ok_or_else(|| {
                eyre::eyre!(
                    "no OAuth client configured; set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET"
                )
            })?;
            oauth
                .authenticate_in_browser()
                .await
                .context("authorize in browser")?;
            eprintln!("==> authorized");
            auth_status(&publisher).await
        }
        Command::AuthUrl => {
            let url = publisher
                .authorization_url()
                .context("build authorization URL")?;
            println!("{url}");
            Ok(())
        }
        Command::ExchangeCode { code } => {
            if !youtube_publisher::auth::looks_like_authorization_code(&code) {
                eprintln!("warning: that doesn't look like an authorization code");
            }
            if publisher.exchange_code_for_token(code.trim()).await {
                eprintln!("==> authorized");
                Ok(())
            } else {
                Err(eyre::eyre!("authorization code exchange failed"))
            }
        }
        Command::File {
            path,
            duration,
            title,
        } => {
            let upload = LocalUpload::stage_copy(&path, config.temp_root())
                .await
                .with_context(|| format!("stage {}", path.display()))?;
            let mut upload = upload.with_uploader(requester().as_str());
            if let Some(duration) = duration {
                upload = upload.with_duration(duration);
            }
            if let Some(title) = title {
                upload = upload.with_title(title);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(rx));
            let outcome = publisher.publish_from_file(requester(), upload, &tx).await;
            drop(tx);
            let _ = printer.await;
            report(outcome)
        }
        Command::Url { url } => {
            if !youtube_publisher::acquire::is_supported_video_url(&url) {
                eprintln!("warning: not a known video site, trying anyway");
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(rx));
            let outcome = publisher.publish_from_url(requester(), &url, &tx).await;
            drop(tx);
            let _ = printer.await;
            report(outcome)
        }
    }
}

async fn auth_status(publisher: &Publisher) -> eyre::Result<()> {
    let authenticated = publisher.check_authentication().await;
    eprintln!("authenticated : {authenticated}");
    eprintln!("method        : {}", publisher.auth_method());

    let info = publisher.credentials_info().await;
    eprintln!(
        "token file    : exists={} valid={} expired={} refreshable={}",
        info.exists, info.valid, info.expired, info.has_refresh_token
    );
    if let Some(error) = info.error {
        eprintln!("token error   : {error}");
    }

    if authenticated && let Some(channel) = publisher.channel_info().await {
        eprintln!("==> {} ({})", channel.snippet.title, channel.id);
        if let Some(stats) = channel.statistics {
            eprintln!(
                "  Subscribers: {}",
                stats.subscriber_count.as_deref().unwrap_or("N/A")
            );
            eprintln!("  Videos: {}", stats.video_count.as_deref().unwrap_or("N/A"));
            eprintln!("  Views: {}", stats.view_count.as_deref().unwrap_or("N/A"));
        }
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::Stage(stage) => eprintln!("{stage}"),
            PipelineEvent::UploadProgress(percent) => eprintln!("  uploading: {percent}%"),
            PipelineEvent::Found(summary) => {
                eprintln!("==> found: {}", summary.title);
                if let Some(uploader) = &summary.uploader {
                    eprintln!("  Uploader: {uploader}");
                }
                if let Some(duration) = summary.duration {
                    eprintln!("  Duration: {}:{:02}", duration / 60, duration % 60);
                }
                eprintln!("  Views: {}", summary.view_count);
            }
        }
    }
}

fn report(outcome: PipelineOutcome) -> eyre::Result<()> {
    match outcome {
        PipelineOutcome::Published { url, .. } => {
            println!("{url}");
            Ok(())
        }
        other => Err(eyre::eyre!("{other}")),
    }
}
