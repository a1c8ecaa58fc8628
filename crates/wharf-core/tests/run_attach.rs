//! Run/attach/wait behavior through the engine.
//!
//! These tests drive [`Engine`] with the scripted launcher, so every scenario
//! runs in-process without spawning OS processes.

use std::sync::Arc;
use std::time::Duration;
use wharf_config::StreamsConfig;
use wharf_core::test_support::{
    assert_pipe, client, scripted_engine, scripted_engine_with, wait_until, with_timeout,
};
use wharf_core::{
    AttachOptions, CoreError, Engine, LogFormat, LogOptions, Phase, RunOptions, SessionEnd,
};

const LIMIT: Duration = Duration::from_secs(5);

fn cat(interactive: bool, tty: bool) -> RunOptions {
    RunOptions {
        interactive,
        tty,
        ..RunOptions::new("host", ["cat"])
    }
}

async fn read_raw_log(engine: &Engine, id: &str) -> String {
    let reader = engine.logs(id, LogOptions::raw()).await.unwrap();
    String::from_utf8(reader.read_all().await.unwrap()).unwrap()
}

// ==========================================================================
// Run scenarios
// ==========================================================================

#[tokio::test]
async fn test_run_hostname_prints_configured_hostname() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (mut client, transport) = client(false);

    let opts = RunOptions {
        hostname: Some("foobar".to_string()),
        ..RunOptions::new("host", ["hostname"])
    };
    let outcome = with_timeout("run hostname", LIMIT, engine.cmd_run(opts, transport))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(client.read_line().await, "foobar\n");
}

#[tokio::test]
async fn test_run_interactive_cat_echoes_every_line() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(cat(true, false), transport).await })
    };

    assert_pipe(&mut client, "hello\n", "hello\n", 15).await;

    client.close_stdin();
    let outcome = with_timeout("run to return", LIMIT, run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));

    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    assert_eq!(container.state().phase, Phase::Exited);
}

#[tokio::test]
async fn test_run_reports_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);

    let outcome = engine
        .cmd_run(RunOptions::new("host", ["sh", "-c", "exit 3"]), transport)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.session, Some(SessionEnd::Exited(3)));
}

#[tokio::test]
async fn test_run_separates_stdout_and_stderr() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (mut client, transport) = client(false);

    engine
        .cmd_run(
            RunOptions::new("host", ["sh", "-c", "echo out && echo err >&2"]),
            transport,
        )
        .await
        .unwrap();

    assert_eq!(client.read_line().await, "out\n");
    assert_eq!(client.read_stderr_line().await, "err\n");
}

#[tokio::test]
async fn test_run_without_command_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);
    let opts = RunOptions::new("host", Vec::<String>::new());
    assert!(matches!(
        engine.cmd_run(opts, transport).await,
        Err(CoreError::InvalidArgument(_))
    ));
}

// ==========================================================================
// Disconnect policy
// ==========================================================================

#[tokio::test]
async fn test_pipe_stdin_close_stops_cat() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(cat(true, false), transport).await })
    };
    assert_pipe(&mut client, "ping\n", "ping\n", 1).await;

    client.close_stdin();
    let outcome = with_timeout("cat to exit", LIMIT, run)
        .await
        .unwrap()
        .unwrap();
    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    assert!(!container.is_running());
    assert_eq!(outcome.exit_code, Some(0));
}

#[tokio::test]
async fn test_tty_stdin_close_keeps_cat_running() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(cat(true, true), transport).await })
    };
    assert_pipe(&mut client, "ping\n", "ping\r\n", 1).await;

    client.close_stdin();
    let outcome = with_timeout("session to end", LIMIT, run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::StdinClosed));
    assert_eq!(outcome.exit_code, None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    assert!(container.is_running());

    container.kill(9).unwrap();
    assert_eq!(container.wait_timeout(LIMIT).await.unwrap(), 137);
}

#[tokio::test]
async fn test_detached_interactive_survives_attach_disconnect() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));

    let (mut run_client, transport) = client(false);
    let opts = RunOptions {
        detach: true,
        ..cat(true, false)
    };
    let outcome = engine.cmd_run(opts, transport).await.unwrap();
    assert_eq!(outcome.exit_code, None);
    assert_eq!(run_client.read_line().await, format!("{}\n", outcome.id.short()));

    let container = engine.container(outcome.id.short()).await.unwrap();
    with_timeout("start", LIMIT, container.wait_started())
        .await
        .unwrap();

    let (mut attach_client, transport) = client(true);
    let attach = {
        let engine = engine.clone();
        let id = outcome.id.clone();
        tokio::spawn(async move { engine.cmd_attach(id.as_ref(), transport).await })
    };
    assert_pipe(&mut attach_client, "hello\n", "hello\n", 1).await;

    attach_client.close_stdin();
    let end = with_timeout("attach to end", LIMIT, attach)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(end, SessionEnd::StdinClosed);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(container.is_running());

    // closing stdin directly still ends cat
    let pipe = container.stdin_pipe().unwrap();
    pipe.close().await;
    assert_eq!(container.wait_timeout(LIMIT).await.unwrap(), 0);
}

#[tokio::test]
async fn test_attach_stdin_only_output_reaches_log() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);

    let opts = RunOptions {
        attach: Some(AttachOptions {
            stdin: true,
            ..AttachOptions::default()
        }),
        ..cat(true, false)
    };
    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(opts, transport).await })
    };

    let id_line = with_timeout("container id", LIMIT, client.read_line()).await;
    assert_eq!(id_line.trim_end().len(), 12);

    client.send("hello\n").await;
    client.close_stdin();
    let outcome = with_timeout("run to return", LIMIT, run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(id_line.trim_end(), outcome.id.short());

    // stdout carried the id only
    assert_eq!(client.read_line().await, "");
    assert_eq!(read_raw_log(&engine, outcome.id.as_ref()).await, "hello\n");
}

#[tokio::test]
async fn test_second_stdin_client_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (_run_client, transport) = client(false);
    let opts = RunOptions {
        detach: true,
        ..cat(true, false)
    };
    let outcome = engine.cmd_run(opts, transport).await.unwrap();

    let (mut first, transport) = client(true);
    let _session = {
        let engine = engine.clone();
        let id = outcome.id.clone();
        tokio::spawn(async move { engine.cmd_attach(id.as_ref(), transport).await })
    };
    assert_pipe(&mut first, "mine\n", "mine\n", 1).await;

    let (_second, transport) = client(true);
    let err = engine
        .cmd_attach(outcome.id.as_ref(), transport)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyAttached(_)));

    // read-only observers are always welcome
    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    let (mut observer, transport) = client(false);
    let observing = container
        .attach(AttachOptions::outputs(), transport)
        .unwrap();
    first.send("shared\n").await;
    assert_eq!(first.read_line().await, "shared\n");
    assert_eq!(observer.read_line().await, "shared\n");

    container.kill(9).unwrap();
    assert_eq!(
        with_timeout("observer to end", LIMIT, observing.wait()).await,
        SessionEnd::Exited(137)
    );
}

// ==========================================================================
// Disconnect and exit commute
// ==========================================================================

#[tokio::test]
async fn test_exit_before_disconnect() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);
    let opts = RunOptions {
        interactive: true,
        ..RunOptions::new("host", ["sh", "-c", "echo bye && exit 4"])
    };

    let outcome = with_timeout("run", LIMIT, engine.cmd_run(opts, transport))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(4));
    client.close_stdin();

    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    let state = container.state();
    assert_eq!(state.phase, Phase::Exited);
    assert_eq!(state.exit_code, 4);
    assert!(container.stdin_pipe().is_err());
}

#[tokio::test]
async fn test_disconnect_before_exit() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (mut client, transport) = client(true);
    let opts = RunOptions {
        interactive: true,
        tty: true,
        ..RunOptions::new("host", ["sh", "-c", "sleep 0.3 && echo bye && exit 4"])
    };

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(opts, transport).await })
    };
    client.close_stdin();
    let outcome = with_timeout("session to end", LIMIT, run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::StdinClosed));

    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    assert_eq!(container.wait_timeout(LIMIT).await.unwrap(), 4);
    let state = container.state();
    assert_eq!(state.phase, Phase::Exited);
    assert_eq!(state.exit_code, 4);
    assert!(container.stdin_pipe().is_err());
    assert_eq!(read_raw_log(&engine, outcome.id.as_ref()).await, "bye\r\n");
}

#[tokio::test]
async fn test_lost_client_returns_run_while_process_ignores_eof() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (client, transport) = client(true);
    let opts = RunOptions {
        interactive: true,
        ..RunOptions::new("host", ["sleep", "30"])
    };

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cmd_run(opts, transport).await })
    };
    let container = wait_for_container(&engine).await;
    with_timeout("start", LIMIT, container.wait_started())
        .await
        .unwrap();

    drop(client);
    let outcome = with_timeout("run to return", Duration::from_secs(3), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::TransportClosed));
    assert_eq!(outcome.exit_code, None);

    // sleep ignores its stdin, so it is still running
    assert!(container.is_running());
    container.kill(9).unwrap();
    assert_eq!(container.wait_timeout(LIMIT).await.unwrap(), 137);
}

async fn wait_for_container(engine: &Engine) -> Arc<wharf_core::Container> {
    with_timeout("container to be created", LIMIT, async {
        loop {
            if let Some(container) = engine.list().await.into_iter().next() {
                return container;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

// ==========================================================================
// Wait and logs
// ==========================================================================

#[tokio::test]
async fn test_concurrent_waits_after_exit() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (_client, transport) = client(false);
    let outcome = engine
        .cmd_run(RunOptions::new("host", ["sh", "-c", "exit 7"]), transport)
        .await
        .unwrap();

    let waiters: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            let id = outcome.id.clone();
            tokio::spawn(async move { engine.cmd_wait(id.as_ref()).await })
        })
        .collect();
    for waiter in waiters {
        let code = with_timeout("wait", LIMIT, waiter).await.unwrap().unwrap();
        assert_eq!(code, 7);
    }
}

#[tokio::test]
async fn test_wait_blocks_until_exit() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (_client, transport) = client(false);
    let opts = RunOptions {
        detach: true,
        ..RunOptions::new("host", ["sleep", "0.2"])
    };
    let outcome = engine.cmd_run(opts, transport).await.unwrap();
    let container = engine.container(outcome.id.as_ref()).await.unwrap();
    assert!(container.is_running());

    let code = with_timeout("wait", LIMIT, engine.cmd_wait(outcome.id.as_ref()))
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert!(!container.is_running());
}

#[tokio::test]
async fn test_log_records_every_byte_in_order() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);
    let outcome = engine
        .cmd_run(
            RunOptions::new("host", ["sh", "-c", "echo one && echo two >&2 && echo three"]),
            transport,
        )
        .await
        .unwrap();
    let id = outcome.id.to_string();

    let mut reader = engine.logs(&id, LogOptions::default()).await.unwrap();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(record) = reader.next_record().await.unwrap() {
        match record.stream.to_string().as_str() {
            "stdout" => stdout.push(record.log),
            _ => stderr.push(record.log),
        }
    }
    // order is kept per stream; the two pumps interleave freely
    assert_eq!(stdout, vec!["one\n", "three\n"]);
    assert_eq!(stderr, vec!["two\n"]);

    let json = LogOptions {
        format: LogFormat::Json,
        ..LogOptions::default()
    };
    let first = engine.logs(&id, json).await.unwrap().read_all().await.unwrap();
    let second = engine.logs(&id, json).await.unwrap().read_all().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(String::from_utf8(first).unwrap().lines().count(), 3);
}

#[tokio::test]
async fn test_slow_client_is_detached_and_log_stays_complete() {
    let root = tempfile::tempdir().unwrap();
    let streams = StreamsConfig {
        fanout_buffer: 2,
        read_chunk_size: 256,
        drain_timeout_ms: 200,
    };
    let engine = scripted_engine_with(root.path(), streams);
    // the client never reads its stdout
    let (_client, transport) = client(false);

    let outcome = with_timeout(
        "run with stalled client",
        LIMIT,
        engine.cmd_run(RunOptions::new("host", ["seq", "20000"]), transport),
    )
    .await
    .unwrap();
    assert_eq!(outcome.exit_code, Some(0));

    let expected: String = (1..=20000).map(|i| format!("{}\n", i)).collect();
    assert_eq!(read_raw_log(&engine, outcome.id.as_ref()).await, expected);
}

#[tokio::test]
async fn test_follow_log_until_exit() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(scripted_engine(root.path()));
    let (_client, transport) = client(false);
    let opts = RunOptions {
        detach: true,
        ..RunOptions::new("host", ["sh", "-c", "echo early && sleep 0.2 && echo late"])
    };
    let outcome = engine.cmd_run(opts, transport).await.unwrap();

    let follow = LogOptions {
        follow: true,
        ..LogOptions::raw()
    };
    let reader = engine.logs(outcome.id.as_ref(), follow).await.unwrap();
    let out = with_timeout("follow", LIMIT, reader.read_all())
        .await
        .unwrap();
    assert_eq!(out, b"early\nlate\n");
}

// ==========================================================================
// Start failures and registry
// ==========================================================================

#[tokio::test]
async fn test_unknown_image_leaves_container_created() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);

    let err = engine
        .cmd_run(RunOptions::new("nosuchimage", ["cat"]), transport)
        .await
        .unwrap_err();
    assert!(err.is_image_not_found(), "unexpected error: {}", err);

    let all = engine.list().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state().phase, Phase::Created);
}

#[tokio::test]
async fn test_missing_command_is_not_executable() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);

    let err = engine
        .cmd_run(RunOptions::new("host", ["/no/such/binary"]), transport)
        .await
        .unwrap_err();
    assert!(err.is_not_executable(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_wait_started_fires_on_start() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let container = engine
        .create(wharf_core::ContainerConfig {
            image: "host".to_string(),
            cmd: vec!["true".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    let waiter = {
        let container = container.clone();
        tokio::spawn(async move { container.wait_started().await })
    };
    container.start().await.unwrap();
    with_timeout("start signal", LIMIT, waiter)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_reopened_engine_restores_containers() {
    let root = tempfile::tempdir().unwrap();
    let id = {
        let engine = scripted_engine(root.path());
        let (_client, transport) = client(false);
        engine
            .cmd_run(RunOptions::new("host", ["echo", "persisted"]), transport)
            .await
            .unwrap()
            .id
    };

    let engine = Engine::open(
        Default::default(),
        root.path().to_path_buf(),
        Arc::new(wharf_runtime::scripted::ScriptedLauncher::new()),
    )
    .await
    .unwrap();
    let container = engine.container(id.short()).await.unwrap();
    assert_eq!(container.state().phase, Phase::Exited);
    assert_eq!(read_raw_log(&engine, id.as_ref()).await, "persisted\n");
}

#[tokio::test]
async fn test_stale_running_record_is_marked_exited() {
    let root = tempfile::tempdir().unwrap();
    let dir = {
        let engine = scripted_engine(root.path());
        let container = engine
            .create(wharf_core::ContainerConfig {
                image: "host".to_string(),
                cmd: vec!["cat".to_string()],
                open_stdin: true,
                ..Default::default()
            })
            .await
            .unwrap();
        container.start().await.unwrap();
        wait_until("record saved as running", LIMIT, || {
            wharf_core::ContainerRecord::load(container.dir())
                .map(|r| r.state.running)
                .unwrap_or(false)
        })
        .await;
        container.dir().to_path_buf()
    };

    let engine = Engine::open(
        Default::default(),
        root.path().to_path_buf(),
        Arc::new(wharf_runtime::scripted::ScriptedLauncher::new()),
    )
    .await
    .unwrap();
    let restored = engine.list().await;
    assert_eq!(restored.len(), 1);
    let state = restored[0].state();
    assert_eq!(state.phase, Phase::Exited);
    assert_eq!(state.exit_code, -1);
    assert_eq!(
        wharf_core::ContainerRecord::load(&dir).unwrap().state.exit_code,
        -1
    );
}

#[tokio::test]
async fn test_remove_container() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);
    let outcome = engine
        .cmd_run(RunOptions::new("host", ["true"]), transport)
        .await
        .unwrap();
    let dir = engine
        .container(outcome.id.as_ref())
        .await
        .unwrap()
        .dir()
        .to_path_buf();

    engine.remove(outcome.id.short(), true).await.unwrap();
    assert!(!dir.exists());
    assert!(matches!(
        engine.container(outcome.id.as_ref()).await,
        Err(CoreError::ContainerNotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_keeps_log_unless_purged() {
    let root = tempfile::tempdir().unwrap();
    let engine = scripted_engine(root.path());
    let (_client, transport) = client(false);
    let outcome = engine
        .cmd_run(RunOptions::new("host", ["echo", "kept"]), transport)
        .await
        .unwrap();
    let dir = engine
        .container(outcome.id.as_ref())
        .await
        .unwrap()
        .dir()
        .to_path_buf();

    engine.remove(outcome.id.short(), false).await.unwrap();
    assert!(!dir.join("config.json").exists());
    let log = dir.join(format!("{}-json.log", outcome.id));
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.contains("\"log\":\"kept\\n\""));
}

#[cfg(unix)]
#[tokio::test]
async fn test_container_supervised_elsewhere_is_observed() {
    let root = tempfile::tempdir().unwrap();
    let dir = wharf_core::containers_dir(root.path()).join("remote0000000000");
    let mut record = wharf_core::ContainerRecord {
        id: wharf_runtime::ContainerId::new("remote0000000000"),
        created: chrono::Utc::now(),
        config: wharf_core::ContainerConfig {
            image: "host".to_string(),
            cmd: vec!["cat".to_string()],
            ..Default::default()
        },
        state: wharf_core::State {
            phase: Phase::Running,
            running: true,
            generation: 1,
            ..Default::default()
        },
        // pid 1 stands in for another live engine
        supervisor: Some(1),
    };
    record.save(&dir).unwrap();
    let log = dir.join("remote0000000000-json.log");
    std::fs::write(
        &log,
        "{\"log\":\"one\\n\",\"stream\":\"stdout\",\"time\":\"2024-01-01T00:00:00Z\"}\n",
    )
    .unwrap();

    let engine = scripted_engine(root.path());
    engine.load().await.unwrap();
    let container = engine.container("remote").await.unwrap();
    assert!(container.is_running());
    let mut follow = container.read_log(LogOptions {
        follow: true,
        ..LogOptions::raw()
    });
    assert_eq!(
        with_timeout("first line", LIMIT, follow.next_chunk())
            .await
            .unwrap()
            .unwrap(),
        b"one\n"
    );

    // the owning process appends and then records the exit
    let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
    std::io::Write::write_all(
        &mut file,
        b"{\"log\":\"two\\n\",\"stream\":\"stdout\",\"time\":\"2024-01-01T00:00:01Z\"}\n",
    )
    .unwrap();
    assert_eq!(
        with_timeout("appended line", LIMIT, follow.next_chunk())
            .await
            .unwrap()
            .unwrap(),
        b"two\n"
    );

    record.state.phase = Phase::Exited;
    record.state.running = false;
    record.state.exit_code = 4;
    record.supervisor = None;
    record.save(&dir).unwrap();

    assert_eq!(container.wait_timeout(LIMIT).await.unwrap(), 4);
    assert!(with_timeout("follow to end", LIMIT, follow.next_chunk())
        .await
        .unwrap()
        .is_none());
}
