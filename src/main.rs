use std::{io::Write as _, net::SocketAddr, path::PathBuf};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use wiretap::{
    config::Config,
    logging,
    message::{Message, MessageId},
    store::{MessageSearch, MessageStore, RetentionLimit},
    tap::{Tap, TapId, TapRegistry},
};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "wiretap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capturing reverse proxy.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        /// Enable capture regardless of `server.debug`.
        #[arg(long)]
        debug: bool,
    },
    /// Manage path taps.
    Tap {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: TapCommand,
    },
    /// Inspect captured messages.
    Message {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: MessageCommand,
    },
    /// Run one retention sweep with the configured limit.
    Prune {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum TapCommand {
    /// List taps.
    List,
    /// Add a tap for paths matching a regex.
    Add { pattern: String },
    /// Replace the regex of an existing tap.
    Edit { id: i64, pattern: String },
    /// Remove a tap.
    Remove { id: i64 },
}

#[derive(Debug, Args, Clone, Default, PartialEq, Eq)]
struct ListFilter {
    /// Only messages with this request method.
    #[arg(long)]
    method: Option<String>,
    /// Only messages answered with this status code.
    #[arg(long)]
    status: Option<u16>,
    /// Only messages from this client IP.
    #[arg(long)]
    remote_addr: Option<String>,
    /// Only messages whose path contains this text.
    #[arg(long)]
    path: Option<String>,
}

impl From<ListFilter> for MessageSearch {
    fn from(filter: ListFilter) -> Self {
        Self {
            method: filter.method,
            status: filter.status,
            remote_addr: filter.remote_addr,
            path_contains: filter.path,
        }
    }
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum MessageCommand {
    /// List messages, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        #[command(flatten)]
        filter: ListFilter,
    },
    /// Print one message as JSON.
    Show { id: i64 },
    /// Write a captured body to stdout.
    Body {
        id: i64,
        /// Print the response body instead of the request body.
        #[arg(long)]
        response: bool,
    },
    /// Delete a message and its bodies.
    Delete { id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TapCommandOutcome {
    Listed(Vec<Tap>),
    Added(Tap),
    Edited(Tap),
    Removed(TapId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MessageCommandOutcome {
    Listed { messages: Vec<Message>, total: u64 },
    Shown(Message),
    Body(Vec<u8>),
    Deleted(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PruneOutcome {
    limit: RetentionLimit,
    evicted: usize,
}

async fn run_tap_command(
    config: &Config,
    command: TapCommand,
) -> anyhow::Result<TapCommandOutcome> {
    let store = MessageStore::from_config(config)?;
    let taps = TapRegistry::new(&store);

    match command {
        TapCommand::List => Ok(TapCommandOutcome::Listed(taps.list_taps().await?)),
        TapCommand::Add { pattern } => Ok(TapCommandOutcome::Added(
            taps.create_tap(&pattern).await?,
        )),
        TapCommand::Edit { id, pattern } => Ok(TapCommandOutcome::Edited(
            taps.update_tap(TapId(id), &pattern).await?,
        )),
        TapCommand::Remove { id } => {
            taps.delete_tap(TapId(id)).await?;
            Ok(TapCommandOutcome::Removed(TapId(id)))
        }
    }
}

async fn run_message_command(
    config: &Config,
    command: MessageCommand,
) -> anyhow::Result<MessageCommandOutcome> {
    let store = MessageStore::from_config(config)?;

    match command {
        MessageCommand::List {
            offset,
            limit,
            filter,
        } => {
            let search = MessageSearch::from(filter);
            let messages = store.search_messages(search.clone(), offset, limit).await?;
            let total = store.count_matching(search).await?;
            Ok(MessageCommandOutcome::Listed { messages, total })
        }
        MessageCommand::Show { id } => Ok(MessageCommandOutcome::Shown(
            require_message(&store, MessageId(id)).await?,
        )),
        MessageCommand::Body { id, response } => {
            let message = require_message(&store, MessageId(id)).await?;
            let (blob, side) = if response {
                (message.response_body.as_ref(), "response")
            } else {
                (message.request_body.as_ref(), "request")
            };
            let Some(blob) = blob else {
                bail!("message {id} has no {side} body");
            };
            Ok(MessageCommandOutcome::Body(store.read_blob(blob).await?))
        }
        MessageCommand::Delete { id } => {
            if !store.delete_message(MessageId(id)).await? {
                bail!("message {id} not found");
            }
            Ok(MessageCommandOutcome::Deleted(MessageId(id)))
        }
    }
}

async fn require_message(store: &MessageStore, id: MessageId) -> anyhow::Result<Message> {
    store
        .get_message(id)
        .await?
        .with_context(|| format!("message {id} not found"))
}

async fn run_prune(config: &Config) -> anyhow::Result<PruneOutcome> {
    let store = MessageStore::from_config(config)?;
    let limit = config.capture.max_messages;
    let evicted = store.enforce_retention(limit).await?;
    Ok(PruneOutcome { limit, evicted })
}

fn print_tap_command_outcome(outcome: TapCommandOutcome) {
    match outcome {
        TapCommandOutcome::Listed(taps) => {
            for tap in taps {
                println!("{}\t{}", tap.id, tap.path_regex);
            }
        }
        TapCommandOutcome::Added(tap) => {
            println!("added tap {} `{}`", tap.id, tap.path_regex);
        }
        TapCommandOutcome::Edited(tap) => {
            println!("updated tap {} `{}`", tap.id, tap.path_regex);
        }
        TapCommandOutcome::Removed(id) => {
            println!("removed tap {id}");
        }
    }
}

fn print_message_command_outcome(outcome: MessageCommandOutcome) -> anyhow::Result<()> {
    match outcome {
        MessageCommandOutcome::Listed { messages, total } => {
            for message in &messages {
                println!("{}", message_summary_line(message));
            }
            eprintln!("{} of {total} messages", messages.len());
        }
        MessageCommandOutcome::Shown(message) => {
            let json =
                serde_json::to_string_pretty(&message).context("serialize message as JSON")?;
            println!("{json}");
        }
        MessageCommandOutcome::Body(bytes) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes).context("write body to stdout")?;
            stdout.flush().context("flush stdout")?;
        }
        MessageCommandOutcome::Deleted(id) => {
            println!("deleted message {id}");
        }
    }
    Ok(())
}

fn message_summary_line(message: &Message) -> String {
    let response_line = message.response_line();
    let duration = message
        .duration()
        .map(|duration| format!("{}ms", duration.as_millis()))
        .unwrap_or_else(|| "-".to_owned());
    format!(
        "{}\t{}\t{}\t{}\t{}",
        message.id,
        message.remote_addr,
        message.request_line(),
        if response_line.is_empty() {
            "(pending)"
        } else {
            &response_line
        },
        duration
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            log_level,
            debug,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if debug {
                config.server.debug = true;
            }
            logging::init(&config, log_level.as_deref())?;
            let server = wiretap::server::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, server.listen_addr));
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Command::Tap { config, action } => {
            let config = Config::load(config.as_deref())?;
            let outcome = run_tap_command(&config, action).await?;
            print_tap_command_outcome(outcome);
        }
        Command::Message { config, action } => {
            let config = Config::load(config.as_deref())?;
            let outcome = run_message_command(&config, action).await?;
            print_message_command_outcome(outcome)?;
        }
        Command::Prune { config } => {
            let config = Config::load(config.as_deref())?;
            let outcome = run_prune(&config).await?;
            println!(
                "evicted {} messages (max_messages={})",
                outcome.evicted, outcome.limit
            );
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    format!(
        "startup config: listen={}, upstream={}, capture={}, storage_path={}, max_messages={}, configured_taps={}",
        listen_addr,
        config.server.upstream.as_deref().unwrap_or("none"),
        if config.server.debug {
            "enabled"
        } else {
            "disabled"
        },
        config.storage.path.display(),
        config.capture.max_messages,
        config.taps.len()
    )
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::Path, path::PathBuf};

    use super::{
        Cli, Command, ListFilter, MessageCommand, MessageCommandOutcome, TapCommand,
        TapCommandOutcome, message_summary_line, run_message_command, run_prune, run_tap_command, startup_summary,
    };
    use clap::Parser;
    use tempfile::tempdir;
    use wiretap::{
        config::Config,
        message::{HeaderList, Message, MessageId, NewMessage},
        store::{CapturedBody, MessageStore, ResponseCapture, RetentionLimit},
        tap::TapId,
    };

    fn config_with_storage(base_path: &Path, max_messages: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
[server]
listen = "127.0.0.1:8080"
upstream = "http://127.0.0.1:3000"

[storage]
path = "{}"

[capture]
max_messages = {max_messages}
"#,
            base_path.display()
        ))
        .expect("config should parse")
    }

    async fn seed_message(store: &MessageStore, path: &str, started_at_unix_ms: i64) -> Message {
        let mut spill = store.open_spill().await.unwrap();
        spill.append(b"{\"ping\":true}").unwrap();
        let message = store
            .create_message(
                NewMessage {
                    started_at_unix_ms,
                    ended_at_unix_ms: started_at_unix_ms + 3,
                    remote_addr: "127.0.0.1".to_owned(),
                    method: "POST".to_owned(),
                    path: path.to_owned(),
                    request_headers: HeaderList::new(),
                },
                Some(CapturedBody {
                    spill,
                    content_type: Some("application/json".to_owned()),
                }),
            )
            .await
            .unwrap();
        store
            .finalize_message(
                message.id,
                ResponseCapture {
                    status_code: 200,
                    reason_phrase: "OK".to_owned(),
                    headers: HeaderList::new(),
                    body: None,
                },
            )
            .await
            .unwrap()
    }

    #[test]
    fn serve_parses_without_flags() {
        let cli = Cli::try_parse_from(["wiretap", "serve"]).expect("cli parse should succeed");
        match cli.command {
            Command::Serve {
                config,
                log_level,
                debug,
            } => {
                assert_eq!(config, None);
                assert_eq!(log_level, None);
                assert!(!debug);
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn serve_parses_with_all_flags() {
        let cli = Cli::try_parse_from([
            "wiretap",
            "serve",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
            "--debug",
        ])
        .expect("cli parse should succeed");
        match cli.command {
            Command::Serve {
                config,
                log_level,
                debug,
            } => {
                assert_eq!(config, Some(PathBuf::from("custom.toml")));
                assert_eq!(log_level.as_deref(), Some("debug"));
                assert!(debug);
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn tap_and_message_subcommands_parse() {
        let cli = Cli::try_parse_from(["wiretap", "tap", "edit", "3", "^/v2/"])
            .expect("cli parse should succeed");
        match cli.command {
            Command::Tap { action, .. } => assert_eq!(
                action,
                TapCommand::Edit {
                    id: 3,
                    pattern: "^/v2/".to_owned()
                }
            ),
            other => panic!("expected tap command, got {other:?}"),
        }

        let cli = Cli::try_parse_from(["wiretap", "message", "list", "--limit", "5"])
            .expect("cli parse should succeed");
        match cli.command {
            Command::Message { action, .. } => {
                assert_eq!(
                    action,
                    MessageCommand::List {
                        offset: 0,
                        limit: 5,
                        filter: ListFilter::default(),
                    }
                )
            }
            other => panic!("expected message command, got {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "wiretap",
            "message",
            "list",
            "--method",
            "POST",
            "--status",
            "500",
            "--remote-addr",
            "10.0.0.7",
            "--path",
            "/users",
        ])
        .expect("cli parse should succeed");
        match cli.command {
            Command::Message { action, .. } => assert_eq!(
                action,
                MessageCommand::List {
                    offset: 0,
                    limit: 50,
                    filter: ListFilter {
                        method: Some("POST".to_owned()),
                        status: Some(500),
                        remote_addr: Some("10.0.0.7".to_owned()),
                        path: Some("/users".to_owned()),
                    },
                }
            ),
            other => panic!("expected message command, got {other:?}"),
        }

        let cli = Cli::try_parse_from(["wiretap", "message", "body", "9", "--response"])
            .expect("cli parse should succeed");
        match cli.command {
            Command::Message { action, .. } => assert_eq!(
                action,
                MessageCommand::Body {
                    id: 9,
                    response: true
                }
            ),
            other => panic!("expected message command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tap_add_list_edit_remove_round_trip() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path(), "1000");

        let added = match run_tap_command(
            &config,
            TapCommand::Add {
                pattern: "^/test".to_owned(),
            },
        )
        .await
        .unwrap()
        {
            TapCommandOutcome::Added(tap) => tap,
            other => panic!("expected added tap, got {other:?}"),
        };
        assert_eq!(added.path_regex, "^/test");

        let edited = run_tap_command(
            &config,
            TapCommand::Edit {
                id: added.id.0,
                pattern: "^/api/".to_owned(),
            },
        )
        .await
        .unwrap();
        match edited {
            TapCommandOutcome::Edited(tap) => {
                assert_eq!(tap.id, added.id);
                assert_eq!(tap.path_regex, "^/api/");
            }
            other => panic!("expected edited tap, got {other:?}"),
        }

        match run_tap_command(&config, TapCommand::List).await.unwrap() {
            TapCommandOutcome::Listed(taps) => {
                assert_eq!(taps.len(), 1);
                assert_eq!(taps[0].path_regex, "^/api/");
            }
            other => panic!("expected tap list, got {other:?}"),
        }

        assert_eq!(
            run_tap_command(&config, TapCommand::Remove { id: added.id.0 })
                .await
                .unwrap(),
            TapCommandOutcome::Removed(added.id)
        );
        assert_eq!(
            run_tap_command(&config, TapCommand::List).await.unwrap(),
            TapCommandOutcome::Listed(Vec::new())
        );
    }

    #[tokio::test]
    async fn tap_add_rejects_invalid_regex_and_remove_reports_missing() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path(), "1000");

        let err = run_tap_command(
            &config,
            TapCommand::Add {
                pattern: "(unclosed".to_owned(),
            },
        )
        .await
        .unwrap_err();
        assert!(
            err.to_string().contains("(unclosed"),
            "unexpected error: {err}"
        );

        let err = run_tap_command(&config, TapCommand::Remove { id: 42 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&TapId(42).to_string()), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn message_commands_list_show_body_and_delete() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path(), "1000");
        let store = MessageStore::from_config(&config).unwrap();
        let older = seed_message(&store, "/older", 1_000).await;
        let newer = seed_message(&store, "/newer", 2_000).await;

        match run_message_command(
            &config,
            MessageCommand::List {
                offset: 0,
                limit: 10,
                filter: ListFilter::default(),
            },
        )
        .await
        .unwrap()
        {
            MessageCommandOutcome::Listed { messages, total } => {
                assert_eq!(total, 2);
                let ids: Vec<MessageId> = messages.iter().map(|message| message.id).collect();
                assert_eq!(ids, vec![newer.id, older.id]);
            }
            other => panic!("expected message list, got {other:?}"),
        }

        match run_message_command(
            &config,
            MessageCommand::List {
                offset: 0,
                limit: 10,
                filter: ListFilter {
                    path: Some("old".to_owned()),
                    ..ListFilter::default()
                },
            },
        )
        .await
        .unwrap()
        {
            MessageCommandOutcome::Listed { messages, total } => {
                assert_eq!(total, 1);
                assert_eq!(messages, vec![older.clone()]);
            }
            other => panic!("expected message list, got {other:?}"),
        }

        assert_eq!(
            run_message_command(&config, MessageCommand::Show { id: older.id.0 })
                .await
                .unwrap(),
            MessageCommandOutcome::Shown(older.clone())
        );
        assert_eq!(
            run_message_command(
                &config,
                MessageCommand::Body {
                    id: older.id.0,
                    response: false
                }
            )
            .await
            .unwrap(),
            MessageCommandOutcome::Body(b"{\"ping\":true}".to_vec())
        );
        let err = run_message_command(
            &config,
            MessageCommand::Body {
                id: older.id.0,
                response: true,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no response body"), "error: {err}");

        assert_eq!(
            run_message_command(&config, MessageCommand::Delete { id: older.id.0 })
                .await
                .unwrap(),
            MessageCommandOutcome::Deleted(older.id)
        );
        let err = run_message_command(&config, MessageCommand::Show { id: older.id.0 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "error: {err}");
    }

    #[tokio::test]
    async fn prune_applies_configured_limit() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path(), "1");
        let store = MessageStore::from_config(&config).unwrap();
        seed_message(&store, "/a", 1_000).await;
        seed_message(&store, "/b", 2_000).await;
        seed_message(&store, "/c", 3_000).await;

        let outcome = run_prune(&config).await.unwrap();
        assert_eq!(outcome.limit, RetentionLimit::MaxMessages(1));
        assert_eq!(outcome.evicted, 2);
        let remaining = store.list_messages(0, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, "/c");
    }

    #[tokio::test]
    async fn summary_line_shows_request_response_and_duration() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path(), "1000");
        let store = MessageStore::from_config(&config).unwrap();
        let message = seed_message(&store, "/summary", 5_000).await;

        let line = message_summary_line(&message);
        assert_eq!(
            line,
            format!("{}\t127.0.0.1\tPOST /summary\t200 OK\t3ms", message.id)
        );
    }

    #[test]
    fn startup_summary_reports_capture_state() {
        let temp_dir = tempdir().unwrap();
        let mut config = config_with_storage(temp_dir.path(), "\"unlimited\"");
        config.server.debug = true;
        let summary = startup_summary(&config, SocketAddr::from(([127, 0, 0, 1], 18080)));
        assert!(summary.contains("listen=127.0.0.1:18080"), "{summary}");
        assert!(summary.contains("upstream=http://127.0.0.1:3000"), "{summary}");
        assert!(summary.contains("capture=enabled"), "{summary}");
        assert!(summary.contains("max_messages=unlimited"), "{summary}");
    }
}
