//! Driver SDK: the child-process side of the pipe protocol.
//!
//! A driver binary builds a [`Driver`], registers its RPC methods, command
//! handlers and start hook, then calls [`Driver::run`]. The daemon
//! delivers configuration with `command:options`, signals `command:start`
//! on boot and on every hot reload, and the driver answers `state:alive`
//! once its start hook succeeded.
//!
//! stdout belongs to the frame protocol. Logs go to descriptor 3, which
//! the daemon opens as a copy of its own stdout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::command::{self, command_handler, CommandHandler};
use super::DriverError;
use crate::codec::{CodecError, FrameReader, FrameSink, FrameWriter};
use crate::domain::message::{channel, label, subject, NO_REPLY_ID};
use crate::domain::{FeatureConfig, Message};
use crate::rpc::{return_frame, BoxFuture, HandlerError, RpcCaller, RpcError, RpcProvider};

/// Command line every driver accepts
#[derive(Parser, Debug, Clone)]
pub struct DriverArgs {
    /// Service this driver runs under
    pub service: String,

    /// Driver-specific arguments from the daemon configuration
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

type StartHook =
    Arc<dyn Fn(DriverContext, FeatureConfig) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

struct ContextInner {
    name: String,
    service: RwLock<String>,
    args: RwLock<Vec<String>>,
    output: RwLock<Option<Arc<dyn FrameSink>>>,
    options: RwLock<FeatureConfig>,
    starts: AtomicU64,
    caller: RpcCaller,
}

/// Handle passed to every handler of a running driver. Cheap to clone.
#[derive(Clone)]
pub struct DriverContext {
    inner: Arc<ContextInner>,
}

impl DriverContext {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.to_string(),
                service: RwLock::new(String::new()),
                args: RwLock::new(Vec::new()),
                output: RwLock::new(None),
                options: RwLock::new(FeatureConfig::default()),
                starts: AtomicU64::new(0),
                caller: RpcCaller::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Service name from argv
    pub fn service(&self) -> String {
        self.inner
            .service
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Extra arguments from argv
    pub fn args(&self) -> Vec<String> {
        self.inner
            .args
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Configuration from the latest `command:options`
    pub fn options(&self) -> FeatureConfig {
        self.inner
            .options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of `command:start` signals handled so far
    pub fn starts(&self) -> u64 {
        self.inner.starts.load(Ordering::SeqCst)
    }

    fn set_options(&self, options: FeatureConfig) {
        *self.inner.options.write().unwrap_or_else(|e| e.into_inner()) = options;
    }

    fn attach(&self, output: Arc<dyn FrameSink>) {
        *self.inner.output.write().unwrap_or_else(|e| e.into_inner()) = Some(output);
    }

    fn output(&self) -> Result<Arc<dyn FrameSink>, CodecError> {
        self.inner
            .output
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CodecError::Closed)
    }

    /// Send a frame to the daemon
    pub async fn emit(&self, message: &Message) -> Result<(), CodecError> {
        self.output()?.send_frame(message).await
    }

    /// Ask the daemon to restart this driver with a fresh process
    pub async fn request_cold(&self) -> Result<(), CodecError> {
        info!(driver = %self.name(), "requesting cold restart");
        self.emit(&Message::new(channel::STATE, subject::COLD)).await
    }

    /// Call another feature through the daemon
    pub async fn call<P, R>(&self, feature: &str, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let output = self.output()?;
        self.inner
            .caller
            .call(output.as_ref(), feature, method, params)
            .await
    }

    /// Raw-payload variant of [`call`](Self::call)
    pub async fn call_raw(
        &self,
        feature: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let output = self.output()?;
        self.inner
            .caller
            .call_raw(output.as_ref(), feature, method, payload)
            .await
    }
}

/// A driver under construction
pub struct Driver {
    context: DriverContext,
    provider: RpcProvider,
    commands: HashMap<String, CommandHandler>,
    on_start: Option<StartHook>,
}

impl Driver {
    pub fn new(name: &str) -> Self {
        Self {
            context: DriverContext::new(name),
            provider: RpcProvider::new(),
            commands: HashMap::new(),
            on_start: None,
        }
    }

    /// The context handlers will receive
    pub fn context(&self) -> DriverContext {
        self.context.clone()
    }

    /// Register an RPC method with typed JSON parameters and result
    pub fn rpc<P, R, F, Fut>(self, method: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(DriverContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let context = self.context.clone();
        self.provider
            .register(method, move |params: P| handler(context.clone(), params));
        self
    }

    /// Register a handler for `command:<subject>`, run under the retry
    /// wrapper
    pub fn command<F, Fut>(mut self, subject: &str, handler: F) -> Self
    where
        F: Fn(DriverContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let context = self.context.clone();
        self.commands.insert(
            subject.to_string(),
            command_handler(move |message| handler(context.clone(), message)),
        );
        self
    }

    /// Hook run on every `command:start` before `state:alive` is sent.
    /// An error withholds the alive signal.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(DriverContext, FeatureConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_start = Some(Arc::new(move |ctx, options| Box::pin(hook(ctx, options))));
        self
    }

    /// Parse argv, install logging on descriptor 3, and serve stdin/stdout
    pub async fn run(self) -> Result<(), DriverError> {
        let args = DriverArgs::parse();
        init_logging();
        self.run_with(args, tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve the protocol on the given pipes until the daemon closes them
    pub async fn run_with<R, W>(self, args: DriverArgs, input: R, output: W) -> Result<(), DriverError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Driver {
            context,
            provider,
            commands,
            on_start,
        } = self;

        *context.inner.service.write().unwrap_or_else(|e| e.into_inner()) = args.service.clone();
        *context.inner.args.write().unwrap_or_else(|e| e.into_inner()) = args.args;

        let writer = Arc::new(FrameWriter::new(output));
        let sink: Arc<dyn FrameSink> = writer.clone();
        context.attach(sink.clone());

        info!(driver = %context.name(), service = %args.service, "driver running");

        let mut reader = FrameReader::new(input);
        loop {
            let message = match reader.fetch().await {
                Ok(message) => message,
                Err(e) if e.is_closed() => break,
                Err(CodecError::Io(e)) => {
                    writer.close().await;
                    return Err(DriverError::Io(e));
                }
                Err(e) => {
                    warn!(driver = %context.name(), error = %e, "dropping bad frame from daemon");
                    continue;
                }
            };

            let (chan, subj) = (message.channel.clone(), message.subject.clone());
            match (chan.as_str(), subj.as_str()) {
                (channel::COMMAND, subject::OPTIONS) => match message.parse::<FeatureConfig>() {
                    Ok(options) => {
                        debug!(driver = %context.name(), "options received");
                        context.set_options(options);
                    }
                    Err(e) => warn!(driver = %context.name(), error = %e, "invalid options payload"),
                },
                (channel::COMMAND, subject::START) => {
                    let context = context.clone();
                    let hook = on_start.clone();
                    tokio::spawn(start(context, hook));
                }
                (channel::STATE, subject::PING) => {
                    let mut pong = Message::new(channel::STATE, subject::PONG);
                    pong.labels = message.labels.clone();
                    if let Err(e) = sink.send_frame(&pong).await {
                        warn!(driver = %context.name(), error = %e, "failed to answer ping");
                    }
                }
                (channel::RPC, subject::CALL) => {
                    provider.route(message, sink.clone());
                }
                (channel::RPC, subject::RETURN) => {
                    context.inner.caller.handle_return(&message);
                }
                (channel::COMMAND, name) => match commands.get(name) {
                    Some(handler) => {
                        let handler = handler.clone();
                        let sink = sink.clone();
                        tokio::spawn(async move {
                            command::execute(&handler, &message, sink.as_ref()).await;
                        });
                    }
                    None => {
                        warn!(driver = %context.name(), command = %name, "unknown command");
                        if let Some(rpc_id) = message.label(label::RPC_ID) {
                            if rpc_id != NO_REPLY_ID {
                                let reply = return_frame(
                                    rpc_id,
                                    &message.labels,
                                    Err(HandlerError(format!("unknown command {:?}", name))),
                                );
                                if let Err(e) = sink.send_frame(&reply).await {
                                    warn!(driver = %context.name(), command = %name, error = %e, "failed to reject unknown command");
                                }
                            }
                        }
                    }
                },
                _ => debug!(driver = %context.name(), key = %message.key(), "ignoring message"),
            }
        }

        info!(driver = %context.name(), "daemon closed the pipe, exiting");
        writer.close().await;
        Ok(())
    }
}

async fn start(context: DriverContext, hook: Option<StartHook>) {
    if let Some(hook) = hook {
        if let Err(e) = hook(context.clone(), context.options()).await {
            warn!(driver = %context.name(), error = %e, "start hook failed, not signalling alive");
            return;
        }
    }

    context.inner.starts.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = context
        .emit(&Message::new(channel::STATE, subject::ALIVE))
        .await
    {
        warn!(driver = %context.name(), error = %e, "failed to signal alive");
    }
}

/// Install a fmt subscriber on descriptor 3, or stderr when 3 is not open
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false).with_ansi(false);

    let result = match log_file() {
        Some(file) => builder.with_writer(std::sync::Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    // a subscriber may already be installed by the embedding program
    let _ = result;
}

#[cfg(unix)]
fn log_file() -> Option<std::fs::File> {
    use std::os::fd::FromRawFd;

    // SAFETY: F_GETFD only inspects the descriptor table
    if unsafe { libc::fcntl(super::LOG_FD, libc::F_GETFD) } < 0 {
        return None;
    }
    // SAFETY: descriptor 3 is open and nothing else in the driver owns it
    Some(unsafe { std::fs::File::from_raw_fd(super::LOG_FD) })
}

#[cfg(not(unix))]
fn log_file() -> Option<std::fs::File> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    use crate::domain::message::{STATUS_ERROR, STATUS_SUCCESS};

    struct Daemon {
        writer: FrameWriter<WriteHalf<DuplexStream>>,
        reader: FrameReader<ReadHalf<DuplexStream>>,
    }

    impl Daemon {
        async fn send(&self, message: Message) {
            self.writer.send(&message).await.unwrap();
        }

        async fn next(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(5), self.reader.fetch())
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn spawn_driver(driver: Driver) -> (Daemon, tokio::task::JoinHandle<Result<(), DriverError>>) {
        let (daemon_side, driver_side) = duplex(64 * 1024);
        let (driver_in, driver_out) = tokio::io::split(driver_side);
        let (daemon_in, daemon_out) = tokio::io::split(daemon_side);

        let args = DriverArgs {
            service: "billing".to_string(),
            args: vec!["64".to_string()],
        };
        let task = tokio::spawn(driver.run_with(args, driver_in, driver_out));
        let daemon = Daemon {
            writer: FrameWriter::new(daemon_out),
            reader: FrameReader::new(daemon_in),
        };
        (daemon, task)
    }

    fn echo_driver() -> Driver {
        Driver::new("echo")
            .rpc("echo", |_ctx, params: Value| async move { Ok(params) })
            .rpc("whoami", |ctx: DriverContext, _: Value| async move {
                Ok(json!({ "service": ctx.service(), "args": ctx.args(), "options": ctx.options() }))
            })
            .command("flush", |_ctx, _msg| async move { Ok(()) })
    }

    #[test]
    fn test_driver_args() {
        let args = DriverArgs::try_parse_from(["conduit-echo", "billing", "64", "--lru"]).unwrap();
        assert_eq!(args.service, "billing");
        assert_eq!(args.args, vec!["64", "--lru"]);
    }

    #[tokio::test]
    async fn test_options_start_alive_handshake() {
        let (mut daemon, task) = spawn_driver(echo_driver());

        let options = FeatureConfig::new(json!({"size": 64}), json!({"token": "t"}));
        daemon
            .send(Message::new("command", "options").with_json(&options).unwrap())
            .await;
        daemon.send(Message::new("command", "start")).await;

        let alive = daemon.next().await;
        assert!(alive.is("state", "alive"));

        daemon
            .send(
                Message::new("rpc", "call")
                    .with_label("rpcID", "0")
                    .with_label("feature", "kv")
                    .with_label("method", "whoami")
                    .with_label("caller", "-"),
            )
            .await;
        let reply = daemon.next().await;
        assert_eq!(reply.label("status"), Some(STATUS_SUCCESS));
        let body: Value = reply.parse().unwrap();
        assert_eq!(body["service"], "billing");
        assert_eq!(body["args"], json!(["64"]));
        assert_eq!(body["options"]["dynamicData"]["token"], "t");

        drop(daemon);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_hook_withholds_alive() {
        let driver = echo_driver().on_start(|_ctx, options: FeatureConfig| async move {
            if options.data.get("broken").is_some() {
                return Err(HandlerError::from("bad config"));
            }
            Ok(())
        });
        let (mut daemon, _task) = spawn_driver(driver);

        daemon
            .send(
                Message::new("command", "options")
                    .with_json(&FeatureConfig::new(json!({"broken": true}), Value::Null))
                    .unwrap(),
            )
            .await;
        daemon.send(Message::new("command", "start")).await;
        daemon
            .send(Message::new("state", "ping").with_label("nonce", "1"))
            .await;

        // the pong arrives and no alive precedes it
        let next = daemon.next().await;
        assert!(next.is("state", "pong"), "{:?}", next.key());
        assert_eq!(next.label("nonce"), Some("1"));
    }

    #[tokio::test]
    async fn test_commands_reply_and_unknown_commands_fail() {
        let (mut daemon, _task) = spawn_driver(echo_driver());

        daemon
            .send(Message::new("command", "flush").with_label("rpcID", "3"))
            .await;
        let reply = daemon.next().await;
        assert_eq!(reply.label("rpcID"), Some("3"));
        assert_eq!(reply.label("status"), Some(STATUS_SUCCESS));

        daemon
            .send(Message::new("command", "compact").with_label("rpcID", "4"))
            .await;
        let reply = daemon.next().await;
        assert_eq!(reply.label("status"), Some(STATUS_ERROR));
        assert!(reply.label("error").unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn test_undeliverable_reject_keeps_driver_running() {
        let (daemon_out, driver_in) = duplex(64 * 1024);
        let (driver_out, daemon_in) = duplex(64 * 1024);
        let args = DriverArgs {
            service: "billing".to_string(),
            args: Vec::new(),
        };
        let task = tokio::spawn(echo_driver().run_with(args, driver_in, driver_out));

        // nobody reads the driver's output any more
        drop(daemon_in);
        let writer = FrameWriter::new(daemon_out);
        writer
            .send(&Message::new("command", "compact").with_label("rpcID", "4"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        writer.close().await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_call_goes_through_daemon() {
        let driver = echo_driver().rpc("relay", |ctx: DriverContext, params: Value| async move {
            let out: Value = ctx.call("kv", "get", &params).await?;
            Ok(out)
        });
        let (mut daemon, _task) = spawn_driver(driver);

        daemon
            .send(
                Message::new("rpc", "call")
                    .with_label("rpcID", "9")
                    .with_label("method", "relay")
                    .with_raw(br#"{"key":"a"}"#.to_vec()),
            )
            .await;

        // the driver's own outgoing call
        let call = daemon.next().await;
        assert!(call.is("rpc", "call"));
        assert_eq!(call.label("feature"), Some("kv"));
        assert_eq!(call.label("method"), Some("get"));

        daemon
            .send(
                Message::new("rpc", "return")
                    .with_label("rpcID", call.label("rpcID").unwrap())
                    .with_label("status", "success")
                    .with_raw(br#""value-a""#.to_vec()),
            )
            .await;

        let reply = daemon.next().await;
        assert_eq!(reply.label("rpcID"), Some("9"));
        assert_eq!(reply.parse::<String>().unwrap(), "value-a");
    }
}
