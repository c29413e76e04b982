//! Run command: starts a node and drives it from the terminal.
//!
//! This module orchestrates the interactive client:
//! - Address book, backed by the directory unless disabled
//! - Signal handler (SIGTERM/SIGINT log out cleanly)
//! - The node itself, with synthetic media devices
//! - A loop reading commands from stdin and printing node events

use std::sync::Arc;

use parley_core::{DeliveredMessage, Peer};
use parley_node::{DirectoryClient, Node, NodeEvent, PeerBook, SessionInfo, SignalHandler};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::media::SyntheticMedia;
use crate::repl::{HELP, ReplCommand};

/// Starts a node and runs the command loop until /quit, end of input plus a
/// signal, or a signal alone.
pub async fn run(config: &ClientConfig, args: &RunArgs) -> ClientResult<()> {
    let mut config = config.clone();
    config.apply(args)?;
    let node_config = config.node_config()?;

    // 1. Address book
    let peers = if config.directory.enabled {
        let address = config.directory.address();
        let client = DirectoryClient::connect(&address).await.map_err(|e| {
            ClientError::Directory(format!("cannot reach directory at {}: {}", address, e))
        })?;
        Arc::new(PeerBook::with_directory(client))
    } else {
        Arc::new(PeerBook::new())
    };

    // 2. Signal handler
    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener()?;
    let shutdown = signal_handler.shutdown_handle();

    // 3. Node
    let (node, mut events) = Node::start(node_config, peers, Arc::new(SyntheticMedia)).await?;
    if config.directory.enabled {
        node.register().await?;
    }

    let printer = Printer { json: args.json };
    printer.line(&format!(
        "parley {} listening on {}, type /help for commands",
        node.id(),
        node.local_addr()
    ));

    // 4. Command loop
    let mut worker = CommandWorker::spawn(Arc::new(node));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match ReplCommand::parse(&line) {
                    Ok(Some(ReplCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = worker.submit(command) {
                            printer.error(&e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => printer.error(&e),
                },
                None => {
                    info!("Input closed, running until interrupted");
                    stdin_open = false;
                }
            },
            Some(result) = worker.reply() => match result {
                Ok(reply) => printer.reply(&reply),
                Err(e) => printer.error(&e),
            },
            Some(event) = events.recv() => printer.event(&event),
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Shutting down...");
    match worker.stop().await {
        Some(node) => node.shutdown().await,
        None => warn!("Node still shared, skipping logout"),
    }
    Ok(())
}

const COMMAND_QUEUE: usize = 16;

/// Runs typed commands in order on a task of their own, so a dial or send
/// waiting on a peer never holds up event printing or /quit.
pub struct CommandWorker {
    queue: mpsc::Sender<ReplCommand>,
    replies: mpsc::Receiver<ClientResult<Reply>>,
    task: JoinHandle<()>,
    node: Arc<Node>,
}

impl CommandWorker {
    pub fn spawn(node: Arc<Node>) -> Self {
        let (queue, mut commands) = mpsc::channel::<ReplCommand>(COMMAND_QUEUE);
        let (done, replies) = mpsc::channel(COMMAND_QUEUE);
        let runner = node.clone();
        let task = tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let reply = execute(&runner, command).await;
                if done.send(reply).await.is_err() {
                    break;
                }
            }
        });
        Self {
            queue,
            replies,
            task,
            node,
        }
    }

    /// Queues a command without waiting for it to run.
    pub fn submit(&self, command: ReplCommand) -> ClientResult<()> {
        self.queue.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ClientError::Input("too many commands waiting, try again".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ClientError::Input("command runner stopped".to_string())
            }
        })
    }

    /// Next finished command, in submission order.
    pub async fn reply(&mut self) -> Option<ClientResult<Reply>> {
        self.replies.recv().await
    }

    /// Abandons queued and running commands and hands the node back.
    pub async fn stop(self) -> Option<Node> {
        self.task.abort();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Command runner failed");
            }
        }
        debug!("Command runner stopped");
        Arc::try_unwrap(self.node).ok()
    }
}

/// What a command produced.
#[derive(Debug)]
pub enum Reply {
    Done(String),
    Sent(DeliveredMessage),
    Sessions(Vec<SessionInfo>),
    History(Vec<DeliveredMessage>),
    Help,
}

/// Runs one command against the node.
pub async fn execute(node: &Node, command: ReplCommand) -> ClientResult<Reply> {
    let me = node.id();
    let reply = match command {
        ReplCommand::Chat(peer) => {
            let name = node.open_private(peer).await?;
            Reply::Done(format!("opened {}", name))
        }
        ReplCommand::Group(peers) => {
            let name = node.open_group(peers).await?;
            Reply::Done(format!("opened {}", name))
        }
        ReplCommand::Text { session, text } => {
            Reply::Sent(node.send_text(&session.resolve(me)?, &text).await?)
        }
        ReplCommand::Image { session, path } => {
            Reply::Sent(node.send_image(&session.resolve(me)?, &path).await?)
        }
        ReplCommand::File { session, path } => {
            Reply::Sent(node.send_file(&session.resolve(me)?, &path).await?)
        }
        ReplCommand::History(session) => Reply::History(node.history(&session.resolve(me)?).await?),
        ReplCommand::Sessions => Reply::Sessions(node.sessions().await?),
        ReplCommand::Delete(session) => {
            let name = session.resolve(me)?;
            node.delete_session(&name).await?;
            Reply::Done(format!("deleted {}", name))
        }
        ReplCommand::Call(session) => {
            let name = session.resolve(me)?;
            node.request_call(&name).await?;
            Reply::Done(format!("calling in {}", name))
        }
        ReplCommand::Accept(session) => {
            node.accept_call(&session.resolve(me)?).await?;
            Reply::Done("call accepted".to_string())
        }
        ReplCommand::Reject(session) => {
            node.reject_call(&session.resolve(me)?).await?;
            Reply::Done("call rejected".to_string())
        }
        ReplCommand::HangUp => {
            node.hang_up().await?;
            Reply::Done("hung up".to_string())
        }
        ReplCommand::Peer { id, address } => {
            node.peers().learn(Peer::new(id, address.clone()));
            Reply::Done(format!("{} is at {}", id, address))
        }
        ReplCommand::Help => Reply::Help,
        ReplCommand::Quit => Reply::Done(String::new()),
    };
    Ok(reply)
}

/// Prints events and replies as text or JSON lines.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub json: bool,
}

impl Printer {
    fn emit(&self, lines: Vec<String>) {
        for line in lines {
            println!("{}", line);
        }
    }

    pub fn line(&self, text: &str) {
        if self.json {
            self.emit(vec![json_line(&serde_json::json!({ "info": text }))]);
        } else {
            self.emit(vec![text.to_string()]);
        }
    }

    pub fn event(&self, event: &NodeEvent) {
        self.emit(self.render_event(event));
    }

    pub fn reply(&self, reply: &Reply) {
        self.emit(self.render_reply(reply));
    }

    pub fn error(&self, error: &ClientError) {
        warn!(error = %error, "Command failed");
        if self.json {
            self.emit(vec![json_line(&serde_json::json!({ "error": error.to_string() }))]);
        } else {
            eprintln!("error: {}", error);
        }
    }

    pub fn render_event(&self, event: &NodeEvent) -> Vec<String> {
        if self.json {
            vec![json_line(event)]
        } else {
            vec![event.to_string()]
        }
    }

    pub fn render_reply(&self, reply: &Reply) -> Vec<String> {
        match reply {
            Reply::Done(text) if self.json => vec![json_line(&serde_json::json!({ "ok": text }))],
            Reply::Done(text) => vec![text.clone()],
            // The node also reports sends as events.
            Reply::Sent(_) => Vec::new(),
            Reply::Sessions(infos) if self.json => infos.iter().map(json_line).collect(),
            Reply::Sessions(infos) if infos.is_empty() => vec!["no sessions".to_string()],
            Reply::Sessions(infos) => infos.iter().map(ToString::to_string).collect(),
            Reply::History(messages) if self.json => messages.iter().map(json_line).collect(),
            Reply::History(messages) if messages.is_empty() => vec!["no messages".to_string()],
            Reply::History(messages) => messages.iter().map(DeliveredMessage::summary).collect(),
            Reply::Help if self.json => vec![json_line(&serde_json::json!({ "help": HELP }))],
            Reply::Help => HELP.lines().map(str::to_string).collect(),
        }
    }
}

fn json_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}
