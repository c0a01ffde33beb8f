use clap::Parser;
use relaymq::config::{read_endpoint_file, DEFAULT_CLIENT_PORT};
use relaymq::protocol::ConnectionInfo;
use relaymq_client::{Result, Tag, User, UserEvent, UserListener};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "relaymq-client")]
#[command(about = "RelayMQ client shell - publish and follow topics from the terminal")]
struct Args {
    /// Profile name
    name: String,

    /// Directory holding the local profiles (must exist)
    user_dir: PathBuf,

    /// Create a new profile with this name
    #[arg(short = 'c', long = "create", conflicts_with = "load")]
    create: bool,

    /// Load an existing profile with this name
    #[arg(short = 'l', long = "load")]
    load: bool,

    /// IP of the cluster leader's client listener
    #[arg(long, default_value = "127.0.0.1", conflicts_with = "server_file")]
    ip: String,

    /// Port of the cluster leader's client listener
    #[arg(long, default_value_t = DEFAULT_CLIENT_PORT, conflicts_with = "server_file")]
    port: u16,

    /// Read the server endpoint from a key=value file (ip=, port=) instead
    #[arg(short = 'f', long = "server-file")]
    server_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Prints every event as it arrives, so the shell shows what the
/// asynchronous operations actually did.
struct PrintingListener;

impl UserListener for PrintingListener {
    fn on_event(&mut self, event: &UserEvent) {
        if event.success {
            println!("<< {:?} '{}'", event.tag, event.topic_name);
            if event.tag == Tag::MessageReceived {
                println!("   you have a new post on '{}'", event.topic_name);
            }
        } else {
            println!(
                "<< {:?} '{}' FAILED: {}",
                event.tag,
                event.topic_name,
                event.cause.as_deref().unwrap_or("unknown cause")
            );
        }
    }
}

const HELP: &str = "\
commands:
  create <topic>         create a topic on the cluster (and listen to it)
  listen <topic>         listen to an existing topic
  stop <topic>           stop listening to a topic
  delete <topic>         delete a topic from the cluster
  post <topic> <text>    publish a text post to a topic
  pull <topic>           fetch and print everything new on a topic
  unread <topic>         show the unread count of a topic
  help                   print this message
  quit                   exit";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let server = match &args.server_file {
        Some(path) => read_endpoint_file(path)?,
        None => ConnectionInfo::new(args.ip.clone(), args.port),
    };

    let user = if args.load {
        User::load_existing(server, &args.user_dir, &args.name)?
    } else {
        // -c is the default when neither flag is given
        User::create_new(server, &args.user_dir, &args.name)?
    };
    user.add_listener(Box::new(PrintingListener));

    println!("profile '{}' ready; type 'help' for commands", args.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(3, ' ');
        let command = parts.next().unwrap_or("");
        let topic = parts.next();

        match (command, topic) {
            ("", _) => {}
            ("help", _) => println!("{HELP}"),
            ("quit" | "exit", _) => break,
            ("create", Some(topic)) => user.create_topic(topic),
            ("listen", Some(topic)) => user.listen_for_new_topic(topic),
            ("stop", Some(topic)) => user.stop_listening_for_topic(topic),
            ("delete", Some(topic)) => user.delete_topic(topic),
            ("post", Some(topic)) => match parts.next() {
                Some(text) => user.post_data(text.as_bytes().to_vec(), "txt", topic),
                None => println!("usage: post <topic> <text>"),
            },
            ("pull", Some(topic)) => match user.pull(topic) {
                Ok(posts) => {
                    for post in &posts {
                        println!(
                            "  [{}] {}: {}",
                            post.info.id,
                            post.info.poster_name,
                            String::from_utf8_lossy(&post.data)
                        );
                    }
                    println!("  {} new post(s)", posts.len());
                }
                Err(e) => println!("pull failed: {e}"),
            },
            ("unread", Some(topic)) => match user.unread_count(topic) {
                Ok(count) => println!("  {count} unread on '{topic}'"),
                Err(e) => println!("unread failed: {e}"),
            },
            _ => println!("unknown command; type 'help'"),
        }
    }

    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
