use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sydney_contracts::events::{
    EventWriter, GenerativeImage, GenerativeMusic, SourceAttribute, StreamEvent,
};
use sydney_contracts::session::{ConversationStyle, Plugin};
use sydney_engine::cancel::CancelSignal;
use sydney_engine::challenge::ChallengeStrategy;
use sydney_engine::config::ClientConfig;
use sydney_engine::{SydneyClient, TurnRequest};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sydney-rs", version, about = "Bing Chat protocol client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// JSON config file; `SYDNEY_*` variables and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    cookies: Option<PathBuf>,
    #[arg(long, global = true)]
    proxy: Option<String>,
    #[arg(long, global = true)]
    style: Option<String>,
    #[arg(long, global = true)]
    locale: Option<String>,
    #[arg(long, global = true)]
    no_search: bool,
    #[arg(long, global = true)]
    gpt4_turbo: bool,
    #[arg(long = "plugin", global = true)]
    plugins: Vec<String>,
    #[arg(long, global = true)]
    challenge: Option<String>,
    #[arg(long, global = true)]
    bypass_server: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one prompt and stream the answer to stdout.
    Ask(AskArgs),
    /// Read prompts from stdin, carrying the conversation as context.
    Chat(ChatArgs),
    /// Print the account name the cookies belong to.
    Whoami,
    /// Poll the image creator for a generation trigger.
    Image(ImageArgs),
    /// Poll the music creator for a generation trigger.
    Music(MusicArgs),
    /// Upload a picture and print the URL to attach to a prompt.
    Upload(UploadArgs),
    /// Clear the captcha with the configured strategy.
    SolveCaptcha,
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    prompt: String,
    /// File whose content is sent as the conversation context.
    #[arg(long)]
    context_file: Option<PathBuf>,
    #[arg(long, conflicts_with = "image")]
    image_url: Option<String>,
    /// Local picture to upload and attach.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Append each event as a JSON line to this file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Follow image and music triggers until their results are ready.
    #[arg(long)]
    generate_media: bool,
}

#[derive(Debug, Args)]
struct ChatArgs {
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    /// Result page URL from a `generative_image_trigger` event.
    #[arg(long)]
    url: String,
}

#[derive(Debug, Args)]
struct MusicArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    iframe_id: String,
    #[arg(long)]
    request_id: String,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(long)]
    path: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sydney-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SYDNEY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = resolve_config(&cli.global)?;
    let client = SydneyClient::from_config(&config)?;
    match cli.command {
        Command::Ask(args) => run_ask(&client, args),
        Command::Chat(args) => run_chat(&client, args),
        Command::Whoami => {
            println!("{}", client.fetch_user_name()?);
            Ok(0)
        }
        Command::Image(args) => {
            let trigger = GenerativeImage {
                text: args.prompt,
                url: args.url,
            };
            print_images(&client, &trigger, &CancelSignal::new())?;
            Ok(0)
        }
        Command::Music(args) => {
            let trigger = GenerativeMusic {
                text: args.prompt,
                iframe_id: args.iframe_id,
                request_id: args.request_id,
            };
            print_music(&client, &trigger, &CancelSignal::new())?;
            Ok(0)
        }
        Command::Upload(args) => {
            let bytes = fs::read(&args.path)
                .with_context(|| format!("failed to read {}", args.path.display()))?;
            println!("{}", client.upload_image(&bytes)?);
            Ok(0)
        }
        Command::SolveCaptcha => {
            let changed = client.resolve_challenge(&CancelSignal::new())?;
            println!("captcha cleared, {changed} cookies updated");
            Ok(0)
        }
    }
}

fn resolve_config(global: &GlobalArgs) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(global.config.as_deref())?;
    if let Some(path) = &global.cookies {
        config.cookies_file = path.clone();
    }
    if let Some(proxy) = non_empty(global.proxy.as_deref()) {
        config.session.proxy = Some(proxy.to_string());
    }
    if let Some(raw) = &global.style {
        config.session.style = ConversationStyle::parse(raw)
            .with_context(|| format!("unknown conversation style {raw}"))?;
    }
    if let Some(locale) = non_empty(global.locale.as_deref()) {
        config.session.locale = locale.to_string();
    }
    if global.no_search {
        config.session.no_search = true;
    }
    if global.gpt4_turbo {
        config.session.gpt4_turbo = true;
    }
    for raw in &global.plugins {
        let plugin = Plugin::parse(raw).with_context(|| format!("unknown plugin {raw}"))?;
        if !config.session.plugins.contains(&plugin) {
            config.session.plugins.push(plugin);
        }
    }
    if let Some(raw) = &global.challenge {
        config.challenge = ChallengeStrategy::parse(raw)
            .with_context(|| format!("unknown challenge strategy {raw}"))?;
    }
    if let Some(server) = non_empty(global.bypass_server.as_deref()) {
        config.bypass_server = Some(server.to_string());
    }
    Ok(config)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn run_ask(client: &SydneyClient, args: AskArgs) -> Result<i32> {
    let prior_context = match &args.context_file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => String::new(),
    };
    let image_url = match &args.image {
        Some(path) => {
            let bytes =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            Some(client.upload_image(&bytes)?)
        }
        None => args.image_url.clone(),
    };
    let request = TurnRequest {
        prior_context,
        image_url,
        ..TurnRequest::new(args.prompt.as_str())
    };
    let writer = args.events.as_ref().map(|path| new_event_writer(path));
    let outcome = stream_turn(client, request, writer.as_ref())?;
    if args.generate_media {
        let cancel = CancelSignal::new();
        for trigger in &outcome.images {
            print_images(client, trigger, &cancel)?;
        }
        for trigger in &outcome.music {
            print_music(client, trigger, &cancel)?;
        }
    }
    Ok(if outcome.failed { 1 } else { 0 })
}

fn run_chat(client: &SydneyClient, args: ChatArgs) -> Result<i32> {
    let writer = args.events.as_ref().map(|path| new_event_writer(path));
    let mut context = String::new();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let prompt = line?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt, "/quit" | "/exit") {
            break;
        }
        let request = TurnRequest {
            prior_context: context.clone(),
            ..TurnRequest::new(prompt)
        };
        let outcome = stream_turn(client, request, writer.as_ref())?;
        context.push_str(&format!(
            "[user](#message)\n{prompt}\n\n[assistant](#message)\n{}\n\n",
            outcome.text
        ));
    }
    Ok(0)
}

#[derive(Debug, Default)]
struct TurnOutcome {
    text: String,
    images: Vec<GenerativeImage>,
    music: Vec<GenerativeMusic>,
    failed: bool,
}

fn new_event_writer(path: &Path) -> EventWriter {
    EventWriter::new(path, uuid::Uuid::new_v4().to_string())
}

fn stream_turn(
    client: &SydneyClient,
    request: TurnRequest,
    writer: Option<&EventWriter>,
) -> Result<TurnOutcome> {
    let mut outcome = TurnOutcome::default();
    let mut stdout = io::stdout();
    for event in client.ask_stream(request, CancelSignal::new()) {
        if let Some(writer) = writer {
            if let Err(err) = writer.emit(&event) {
                warn!(error = %err, "cannot write event transcript");
            }
        }
        match event {
            StreamEvent::MessageTextDelta(delta) => {
                outcome.text.push_str(&delta);
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            StreamEvent::SearchQuery(query) => eprintln!("[searching] {query}"),
            StreamEvent::SearchResult(sources) => eprintln!("{}", format_sources(&sources)),
            StreamEvent::Loading(text) => eprintln!("[loading] {text}"),
            StreamEvent::ExecutingTask(text) => eprintln!("[executing] {text}"),
            StreamEvent::SolvingCaptcha(text) => eprintln!("[captcha] {text}"),
            StreamEvent::SuggestedResponses(suggestions) => {
                eprintln!("[suggestions] {}", suggestions.join(" | "));
            }
            StreamEvent::GenerativeImageTrigger(trigger) => {
                eprintln!("[image] {} {}", trigger.text, trigger.url);
                outcome.images.push(trigger);
            }
            StreamEvent::GenerativeMusicTrigger(trigger) => {
                eprintln!("[music] {} ({})", trigger.text, trigger.iframe_id);
                outcome.music.push(trigger);
            }
            StreamEvent::Error(kind) => {
                eprintln!();
                eprintln!("[error] {kind}");
                outcome.failed = true;
            }
        }
    }
    writeln!(stdout)?;
    Ok(outcome)
}

fn format_sources(sources: &[SourceAttribute]) -> String {
    sources
        .iter()
        .map(|source| format!("[{}]: {} \"{}\"", source.index, source.link, source.title))
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_images(
    client: &SydneyClient,
    trigger: &GenerativeImage,
    cancel: &CancelSignal,
) -> Result<()> {
    let result = client.generate_images(trigger, cancel)?;
    if result.image_urls.is_empty() {
        bail!("image creator returned no images");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_music(
    client: &SydneyClient,
    trigger: &GenerativeMusic,
    cancel: &CancelSignal,
) -> Result<()> {
    let result = client.generate_music(trigger, cancel)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Cli> {
        Ok(Cli::try_parse_from(args)?)
    }

    #[test]
    fn flags_override_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sydney.json");
        fs::write(&path, r#"{"style":"Balanced","locale":"en-GB"}"#)?;
        let path_arg = path.to_string_lossy().to_string();
        let cli = parse(&[
            "sydney-rs",
            "--config",
            &path_arg,
            "--style",
            "precise",
            "--plugin",
            "suno",
            "--no-search",
            "whoami",
        ])?;
        let config = resolve_config(&cli.global)?;
        assert_eq!(config.session.style, ConversationStyle::Precise);
        assert_eq!(config.session.locale, "en-GB");
        assert_eq!(config.session.plugins, vec![Plugin::Suno]);
        assert!(config.session.no_search);
        Ok(())
    }

    #[test]
    fn unknown_style_is_rejected() -> anyhow::Result<()> {
        let cli = parse(&["sydney-rs", "--style", "chaotic", "whoami"])?;
        assert!(resolve_config(&cli.global).is_err());
        Ok(())
    }

    #[test]
    fn ask_image_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "sydney-rs",
            "ask",
            "--prompt",
            "hi",
            "--image",
            "a.png",
            "--image-url",
            "https://x",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn sources_render_as_citation_lines() {
        let rendered = format_sources(&[SourceAttribute {
            index: 1,
            link: "https://a.example".to_string(),
            title: "A".to_string(),
        }]);
        assert_eq!(rendered, "[1]: https://a.example \"A\"");
    }
}
