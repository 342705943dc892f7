//! # Daemon - wires the input pipeline, the library and the IPC server together
//!
//! ```text
//!  controller-poll thread                 tokio runtime
//! ┌───────────────────────┐   ┌──────────────────────────────────────────┐
//! │ DeviceReader          │   │ IpcServer ── connection tasks ─┐          │
//! │   → GestureClassifier │   │                                ▼          │
//! │   → route()           │──►│ ActionHub              ControlWorker      │
//! └───────────────────────┘   │                         │      │          │
//!            ▲                │            launch/recent│      │refresh   │
//!            │ bindings watch │                         ▼      ▼          │
//!            └────────────────│ reload         CatalogStore ◄─ refresh task│
//!                             └──────────────────────────────────────────┘
//! ```
//!
//! [`Daemon::start`] brings everything up in dependency order and hands back a
//! [`DaemonHandle`]; [`DaemonHandle::stop`] tears it down again. All tasks share
//! one cancellation token tree rooted in the handle.

pub mod control;

use crate::config::{AppConfig, ConfigPaths};
use crate::controller::controller_handle::{gilrs_backend, BackendFactory};
use crate::controller::ControllerHandle;
use crate::ipc::{ActionHub, ActionSink, IpcServer};
use crate::library::{Catalog, CatalogStore, LibraryScanner};
use crate::mapping::BindingTable;
use crate::persistence::RecentList;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use control::{ControlHandle, ControlWorker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    config: AppConfig,
    paths: ConfigPaths,
    backend: Option<BackendFactory>,
    scanner: Option<LibraryScanner>,
}

impl Daemon {
    pub fn new(config: AppConfig, paths: ConfigPaths) -> Self {
        Self {
            config,
            paths,
            backend: None,
            scanner: None,
        }
    }

    /// Replaces the gilrs backend.
    pub fn with_backend(mut self, factory: BackendFactory) -> Self {
        self.backend = Some(factory);
        self
    }

    /// Replaces the scanner built from the `[library]` section.
    pub fn with_scanner(mut self, scanner: LibraryScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Starts every component. Fails only if the daemon cannot do its job at
    /// all, e.g. when another daemon already owns the socket.
    pub async fn start(self) -> Result<DaemonHandle> {
        let Daemon {
            config,
            paths,
            backend,
            scanner,
        } = self;
        info!("Starting daemon with config dir {}", paths.dir.display());

        let bindings_path = paths.bindings_file();
        if let Err(e) = BindingTable::ensure_default_file(&bindings_path).await {
            warn!("Could not write default bindings: {}", e);
        }
        let bindings = BindingTable::load(&bindings_path).await;
        let (bindings_tx, bindings_rx) = watch::channel(Arc::new(bindings));

        let recent_path = paths.recent_file();
        let recent = RecentList::load(&recent_path, config.library.recent_cap).await;
        let store = Arc::new(CatalogStore::new(recent, recent_path));

        let hub = Arc::new(ActionHub::new(config.ipc.listener_queue));
        let server = IpcServer::bind(&config.ipc.socket_path())
            .await
            .wrap_err("Failed to start IPC server")?;
        let socket_path = server.path().to_path_buf();

        let cancel = CancellationToken::new();
        let refresh = Arc::new(Notify::new());

        let (control, control_task) = ControlWorker {
            store: store.clone(),
            refresh: refresh.clone(),
            bindings_path,
            bindings_tx,
        }
        .spawn(cancel.child_token());

        let scanner = scanner.unwrap_or_else(|| LibraryScanner::from_settings(&config.library));
        let refresh_task = tokio::spawn(refresh_loop(
            scanner,
            store.clone(),
            refresh,
            config.library.refresh_interval(),
            cancel.child_token(),
        ));

        let server_task = tokio::spawn(server.run(
            hub.clone(),
            control.clone(),
            cancel.child_token(),
        ));

        let backend =
            backend.unwrap_or_else(|| gilrs_backend(config.controller.joystick_deadzone));
        let controller = match ControllerHandle::spawn(
            backend,
            config.controller.clone(),
            bindings_rx,
            hub.clone() as Arc<dyn ActionSink>,
            cancel.child_token(),
        ) {
            Ok(controller) => controller,
            Err(e) => {
                cancel.cancel();
                return Err(eyre!("Failed to spawn controller: {}", e));
            }
        };

        info!("Daemon running on {}", socket_path.display());
        Ok(DaemonHandle {
            cancel,
            hub,
            control,
            store,
            socket_path,
            tasks: vec![
                ("ipc server", server_task),
                ("control worker", control_task),
                ("library refresh", refresh_task),
            ],
            controller,
        })
    }
}

async fn refresh_loop(
    scanner: LibraryScanner,
    store: Arc<CatalogStore>,
    refresh: Arc<Notify>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // The first tick fires immediately and does the initial scan
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => debug!("Periodic library refresh"),
            _ = refresh.notified() => {
                debug!("Library refresh requested");
                ticker.reset();
            }
        }

        let report = scanner.scan_cycle(&cancel).await;
        if cancel.is_cancelled() {
            debug!("Discarding scan cut short by shutdown");
            break;
        }
        store.publish(report.records).await;
    }
    debug!("Library refresh task stopped");
}

pub struct DaemonHandle {
    cancel: CancellationToken,
    hub: Arc<ActionHub>,
    control: ControlHandle,
    store: Arc<CatalogStore>,
    socket_path: PathBuf,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    controller: ControllerHandle,
}

impl DaemonHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn catalog_updates(&self) -> watch::Receiver<Arc<Catalog>> {
        self.store.subscribe()
    }

    /// Runs until SIGINT or SIGTERM, reloading bindings on SIGHUP, then stops.
    pub async fn run_until_signal(self) -> Result<()> {
        let mut hangup =
            signal(SignalKind::hangup()).map_err(|e| eyre!("Failed to watch SIGHUP: {}", e))?;
        let mut terminate =
            signal(SignalKind::terminate()).map_err(|e| eyre!("Failed to watch SIGTERM: {}", e))?;
        let mut interrupt =
            signal(SignalKind::interrupt()).map_err(|e| eyre!("Failed to watch SIGINT: {}", e))?;

        loop {
            tokio::select! {
                _ = hangup.recv() => match self.control.reload_bindings().await {
                    Ok(count) => info!("SIGHUP: {} bindings active", count),
                    Err(e) => warn!("SIGHUP: failed to reload bindings: {}", e),
                },
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    break;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Notifies the attached UI, stops every task and removes the socket.
    pub async fn stop(self) {
        info!("Stopping daemon");
        self.hub.shutdown();
        self.cancel.cancel();

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        }

        let controller = self.controller;
        if let Err(e) = tokio::task::spawn_blocking(move || controller.join()).await {
            error!("Failed to join controller thread: {}", e);
        }
        info!("Daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::device::testing::{ScriptedBackend, Step};
    use crate::controller::device::{ButtonType, InputBackend, RawSample};
    use crate::controller::ControllerSettings;
    use crate::ipc::{DetachReason, IpcClient, IpcError, Message, Request};
    use crate::library::scanner::testing::{record, FixedSource};
    use crate::library::testing::scratch_dir;
    use crate::library::{GameSource, IdentityKey, SourceTag};
    use crate::mapping::Action;
    use chrono::{Local, TimeDelta};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;

    type Script = Arc<Mutex<VecDeque<Step>>>;

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.ipc.socket_path = Some(dir.join("daemon.sock").to_string_lossy().into_owned());
        config.controller = ControllerSettings {
            poll_interval_ms: 2,
            reconnect_backoff_ms: 1,
            max_reconnect_backoff_ms: 2,
            ..ControllerSettings::default()
        };
        config
    }

    fn daemon(dir: &Path) -> (Daemon, Script) {
        let script: Script = Arc::new(Mutex::new(VecDeque::new()));
        let backend = ScriptedBackend {
            failures_before_open: 0,
            script: script.clone(),
            opens: Arc::new(Mutex::new(0)),
        };
        let scanner = LibraryScanner::new(
            vec![Arc::new(FixedSource::new(
                SourceTag::Custom,
                vec![
                    record(SourceTag::Custom, IdentityKey::lutris("alpha"), "Alpha"),
                    record(SourceTag::Custom, IdentityKey::steam("123"), "Foo"),
                ],
            )) as Arc<dyn GameSource>],
            Duration::from_secs(1),
        );
        let daemon = Daemon::new(
            config(dir),
            ConfigPaths {
                dir: dir.to_path_buf(),
            },
        )
        .with_backend(Box::new(move || Box::new(backend) as Box<dyn InputBackend>))
        .with_scanner(scanner);
        (daemon, script)
    }

    // Samples stamped slightly ahead of the live idle samples already flowing
    fn tap(script: &Script, button: ButtonType) {
        let base = Local::now() + TimeDelta::milliseconds(50);
        let mut script = script.lock().unwrap();
        for t in [0, 16, 32, 48, 64, 80] {
            script.push_back(Step::Sample(RawSample {
                timestamp: base + TimeDelta::milliseconds(t),
                pressed: BTreeSet::from([button]),
                axis: Default::default(),
            }));
        }
        for t in [96, 112, 128] {
            script.push_back(Step::Sample(RawSample::idle(base + TimeDelta::milliseconds(t))));
        }
    }

    async fn next(client: &mut IpcClient) -> Message {
        tokio::time::timeout(Duration::from_secs(5), client.next_message())
            .await
            .expect("message in time")
            .unwrap()
            .expect("connection open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attached_ui_receives_routed_actions_and_is_replaced() {
        let dir = scratch_dir("daemon-attach");
        let (daemon, script) = daemon(&dir);
        let handle = daemon.start().await.unwrap();

        let mut first = IpcClient::connect(handle.socket_path()).await.unwrap();
        assert_eq!(first.request(&Request::Attach).await.unwrap(), Message::Attached);

        tap(&script, ButtonType::A);
        assert_eq!(
            next(&mut first).await,
            Message::Action {
                action: Action::Select
            }
        );

        let mut second = IpcClient::connect(handle.socket_path()).await.unwrap();
        assert_eq!(second.request(&Request::Attach).await.unwrap(), Message::Attached);
        assert_eq!(
            next(&mut first).await,
            Message::Detached {
                reason: DetachReason::Replaced
            }
        );

        tap(&script, ButtonType::B);
        assert_eq!(
            next(&mut second).await,
            Message::Action {
                action: Action::Back
            }
        );
        // The replaced UI still gets answers, just no actions
        assert_eq!(first.request(&Request::Ping).await.unwrap(), Message::Pong);

        handle.stop().await;
        assert_eq!(
            next(&mut second).await,
            Message::Detached {
                reason: DetachReason::Shutdown
            }
        );
        assert!(!dir.join("daemon.sock").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_connection_detaches_the_listener() {
        let dir = scratch_dir("daemon-disconnect");
        let (daemon, _script) = daemon(&dir);
        let handle = daemon.start().await.unwrap();
        let hub = handle.hub.clone();

        let mut client = IpcClient::connect(handle.socket_path()).await.unwrap();
        client.request(&Request::Attach).await.unwrap();
        assert!(hub.is_attached());
        drop(client);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hub.is_attached() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!hub.is_attached());

        handle.stop().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catalog_and_launch_over_the_socket() {
        let dir = scratch_dir("daemon-catalog");
        let (daemon, _script) = daemon(&dir);
        let handle = daemon.start().await.unwrap();
        handle
            .catalog_updates()
            .wait_for(|catalog| !catalog.games.is_empty())
            .await
            .unwrap();

        let mut client = IpcClient::connect(handle.socket_path()).await.unwrap();
        let Message::Catalog { catalog } = client.request(&Request::GetCatalog).await.unwrap()
        else {
            panic!("expected a catalog");
        };
        let names: Vec<_> = catalog.games.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Foo"]);

        let launch = Request::Launch {
            id: IdentityKey::steam("123"),
        };
        assert_eq!(client.request(&launch).await.unwrap(), Message::Ok);
        let unknown = Request::Launch {
            id: IdentityKey::steam("404"),
        };
        assert!(matches!(
            client.request(&unknown).await.unwrap(),
            Message::Error { .. }
        ));

        let Message::Catalog { catalog } = client.request(&Request::GetCatalog).await.unwrap()
        else {
            panic!("expected a catalog");
        };
        assert_eq!(catalog.recent, vec![IdentityKey::steam("123")]);
        assert!(dir.join("recent.toml").exists());

        let forget = Request::Forget {
            id: IdentityKey::steam("123"),
        };
        assert_eq!(client.request(&forget).await.unwrap(), Message::Ok);
        assert!(handle.catalog_updates().borrow().recent.is_empty());
        assert!(!std::fs::read_to_string(dir.join("recent.toml"))
            .unwrap()
            .contains("steam:123"));
        assert!(dir.join("bindings.toml").exists());

        assert_eq!(
            client.request(&Request::ReloadBindings).await.unwrap(),
            Message::Ok
        );
        assert_eq!(
            client.request(&Request::RefreshLibrary).await.unwrap(),
            Message::Ok
        );

        handle.stop().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_daemon_refuses_a_live_socket() {
        let dir = scratch_dir("daemon-twice");
        let (first, _script) = daemon(&dir);
        let handle = first.start().await.unwrap();

        let (second, _script) = daemon(&dir);
        let err = match second.start().await {
            Ok(_) => panic!("second daemon started"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<IpcError>(),
            Some(IpcError::AlreadyRunning(_))
        ));

        // The running daemon is unaffected
        let mut client = IpcClient::connect(handle.socket_path()).await.unwrap();
        assert_eq!(client.request(&Request::Ping).await.unwrap(), Message::Pong);

        handle.stop().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_does_not_wait_for_a_client_that_never_reads() {
        use tokio::io::AsyncWriteExt;

        let dir = scratch_dir("daemon-stalled");
        let (daemon, _script) = daemon(&dir);
        let handle = daemon.start().await.unwrap();

        let stream = tokio::net::UnixStream::connect(handle.socket_path())
            .await
            .unwrap();
        // Keep the read half open but never read the pongs
        let (_reader, mut writer) = stream.into_split();
        let flood = tokio::spawn(async move {
            let ping = b"{\"type\":\"ping\"}\n".repeat(256);
            while writer.write_all(&ping).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(10), handle.stop())
            .await
            .expect("daemon stopped despite the stalled client");
        assert!(!dir.join("daemon.sock").exists());

        flood.abort();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn garbage_requests_get_an_error_reply() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let dir = scratch_dir("daemon-garbage");
        let (daemon, _script) = daemon(&dir);
        let handle = daemon.start().await.unwrap();

        let stream = tokio::net::UnixStream::connect(handle.socket_path())
            .await
            .unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"type\":\"error\""));

        handle.stop().await;
        let _ = std::fs::remove_dir_all(dir);
    }
}
