//! Integration test: drive the control server over a real TCP socket.
//!
//! Sessions use `pattern://` sources and either an in-memory sink or, on
//! Unix, a shell script standing in for the encoder.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mosaic::compositor::CompositeFrame;
use mosaic::sink::rtp::PUBLISHED_SDP;
use mosaic::source::PatternDecoderFactory;
use mosaic::{
    ChannelRegistry, CompositorConfig, ControlServer, OutputSink, OutputTarget, Protocol,
    PushOutcome, ServerConfig, SessionArtifact, SessionConfig, SessionManager, SinkContext,
    SinkFactory, SinkReady,
};

/// Sink that records pushes and publishes a canned SDP for RTP targets.
struct RecordingSink {
    sdp: Option<PathBuf>,
    scratch_dir: PathBuf,
    pushes: Arc<AtomicU64>,
}

impl OutputSink for RecordingSink {
    fn start(&mut self, _primer: &CompositeFrame) -> mosaic::Result<SinkReady> {
        let artifact = match &self.sdp {
            Some(path) => {
                fs::create_dir_all(&self.scratch_dir)?;
                fs::write(path, "v=0\r\ns=Mosaic\r\nm=video 5004 RTP/AVP 96\r\n")?;
                Some(SessionArtifact::Sdp(path.clone()))
            }
            None => None,
        };
        Ok(SinkReady { artifact, pid: None })
    }

    fn push(&mut self, _frame: &CompositeFrame) -> mosaic::Result<PushOutcome> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(PushOutcome::Continue)
    }

    fn stop(&mut self) {
        let _ = fs::remove_dir_all(&self.scratch_dir);
    }
}

#[derive(Default)]
struct RecordingFactory {
    pushes: Arc<AtomicU64>,
}

impl SinkFactory for RecordingFactory {
    fn create(&self, target: &OutputTarget, context: SinkContext) -> mosaic::Result<Box<dyn OutputSink>> {
        let sdp = (target.protocol == Protocol::Rtp).then(|| context.scratch_dir.join(PUBLISHED_SDP));
        Ok(Box::new(RecordingSink {
            sdp,
            scratch_dir: context.scratch_dir,
            pushes: self.pushes.clone(),
        }))
    }
}

fn registry() -> ChannelRegistry {
    ChannelRegistry::parse(
        "channelName,ipAddress,direction\n\
         CAM1,pattern://ff0000,in\n\
         CAM2,pattern://00ff00,in\n\
         SPARE,,in\n",
    )
    .unwrap()
}

fn session_config(work_dir: PathBuf) -> SessionConfig {
    SessionConfig {
        work_dir,
        compositor: CompositorConfig {
            width: 64,
            height: 36,
            ..CompositorConfig::default()
        },
        ..SessionConfig::default()
    }
}

fn start_server(manager: SessionManager) -> (ControlServer, SocketAddr) {
    let mut server = ControlServer::new(
        manager,
        registry(),
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
    );
    server.start().expect("server start");
    let addr = server.local_addr().expect("bound address");
    (server, addr)
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    /// Send one request on the kept-alive connection; returns status and body.
    fn request(&mut self, method: &str, path: &str, body: &str) -> (u16, String) {
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        self.writer.write_all(request.as_bytes()).unwrap();

        let mut head = String::new();
        loop {
            let mut line = String::new();
            assert!(self.reader.read_line(&mut line).unwrap() > 0, "connection closed");
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        let length = head
            .lines()
            .find_map(|l| {
                l.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        let mut body = vec![0; length];
        self.reader.read_exact(&mut body).unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn json(&mut self, method: &str, path: &str, body: &str) -> (u16, serde_json::Value) {
        let (status, body) = self.request(method, path, body);
        (status, serde_json::from_str(&body).expect("json body"))
    }
}

#[test]
fn control_api_session_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let sinks = Arc::new(RecordingFactory::default());
    let manager = SessionManager::with_factories(
        session_config(tmp.path().to_path_buf()),
        sinks.clone(),
        Arc::new(PatternDecoderFactory::default()),
    )
    .unwrap();
    let (mut server, addr) = start_server(manager.clone());
    let mut client = Client::connect(addr);

    let (status, body) = client.json("GET", "/api/channels", "");
    assert_eq!(status, 200);
    assert_eq!(body["channels"], serde_json::json!(["CAM1", "CAM2", "SPARE"]));

    // Start on the default port with two channels.
    let (status, body) = client.json(
        "POST",
        "/api/start",
        r#"{"ip":"127.0.0.1","channels":["CAM1","SPARE"],"fps":50}"#,
    );
    assert_eq!(status, 200, "{body}");
    let id = body["session"].as_str().unwrap().to_string();
    assert_eq!(body["target"], "rtp://127.0.0.1:5004");
    assert_eq!(body["state"], "running");

    // Same target again is a conflict; a different port is fine.
    let (status, _) = client.json("POST", "/api/start", r#"{"ip":"127.0.0.1","port":5004}"#);
    assert_eq!(status, 409);
    let (status, other) = client.json("POST", "/api/start", r#"{"ip":"127.0.0.1","port":"5006"}"#);
    assert_eq!(status, 200);
    let other_id = other["session"].as_str().unwrap().to_string();

    let (status, sdp) = client.request("GET", &format!("/sdp/{id}"), "");
    assert_eq!(status, 200);
    assert!(sdp.starts_with("v=0"));

    let (status, list) = client.json("GET", "/api/sessions", "");
    assert_eq!(status, 200);
    let sessions = list["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    let first = sessions.iter().find(|s| s["id"] == id.as_str()).unwrap();
    assert_eq!(first["channels"], serde_json::json!(["CAM1", "SPARE"]));

    std::thread::sleep(Duration::from_millis(200));
    assert!(sinks.pushes.load(Ordering::SeqCst) > 0);

    let (status, stopped) = client.json("POST", &format!("/api/stop/{id}"), "");
    assert_eq!(status, 200);
    assert_eq!(stopped["state"], "stopped");
    let (status, _) = client.json("DELETE", &format!("/api/sessions/{other_id}"), "");
    assert_eq!(status, 200);
    let (status, _) = client.json("POST", &format!("/api/stop/{id}"), "");
    assert_eq!(status, 404);
    let (status, _) = client.request("GET", &format!("/sdp/{id}"), "");
    assert_eq!(status, 404);

    let (_, list) = client.json("GET", "/api/sessions", "");
    assert_eq!(list["sessions"], serde_json::json!([]));
    assert!(!tmp.path().join(&id).exists());

    server.stop();
    assert!(!server.is_running());
    manager.shutdown();
}

#[test]
fn control_api_rejects_bad_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = SessionManager::with_factories(
        session_config(tmp.path().to_path_buf()),
        Arc::new(RecordingFactory::default()),
        Arc::new(PatternDecoderFactory::default()),
    )
    .unwrap();
    let (mut server, addr) = start_server(manager.clone());
    let mut client = Client::connect(addr);

    let (status, body) = client.json("POST", "/api/start", r#"{"port":5004}"#);
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid target: ip is required");

    let (status, _) = client.json("POST", "/api/start", r#"{"ip":"10.0.0.1","channels":["CAM9"]}"#);
    assert_eq!(status, 404);

    let (status, _) = client.json("GET", "/api/nope", "");
    assert_eq!(status, 404);

    // A garbage request line closes the connection after a 400.
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    raw.write_all(b"NONSENSE\r\n\r\n").unwrap();
    let mut reply = String::new();
    raw.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request"), "{reply}");

    // A header that never ends is cut off instead of buffered forever.
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut flood = b"GET /api/channels HTTP/1.1\r\nX-Flood: ".to_vec();
    flood.resize(flood.len() + 1024 * 1024, b'a');
    let _ = raw.write_all(&flood);
    let mut reply = Vec::new();
    if let Err(e) = raw.read_to_end(&mut reply) {
        assert!(
            !matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "connection left open: {e}"
        );
    }
    assert!(reply.is_empty() || reply.starts_with(b"HTTP/1.1 431"), "{}", String::from_utf8_lossy(&reply));
    let (status, _) = Client::connect(addr).json("GET", "/api/channels", "");
    assert_eq!(status, 200);

    server.stop();
    assert!(server.start().is_ok(), "server restarts after stop");
    server.stop();
    manager.shutdown();
}

#[cfg(unix)]
#[test]
fn script_encoder_serves_published_sdp() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = session_config(tmp.path().to_path_buf());
    // Writes a raw SDP, then consumes frames like an encoder would.
    config.encoder.encoder_program = "sh".to_string();
    config.encoder.rtp_args = vec![
        "-c".to_string(),
        "printf 'v=0\\no=- 0 0 IN IP4 127.0.0.1\\ns=No Name\\nt=0 0\\nm=video 5004 RTP/AVP 96\\n' > \"$1\"; exec cat > /dev/null"
            .to_string(),
        "sh".to_string(),
        "{sdp}".to_string(),
    ];
    config.encoder.rtp_startup_timeout = Duration::from_secs(5);
    config.encoder.stop_grace = Duration::from_secs(1);

    let manager = SessionManager::with_factories(
        config.clone(),
        Arc::new(mosaic::sink::ProcessSinkFactory::new(config.encoder.clone())),
        Arc::new(PatternDecoderFactory::default()),
    )
    .unwrap();
    let (mut server, addr) = start_server(manager.clone());
    let mut client = Client::connect(addr);

    let (status, body) = client.json("POST", "/api/start", r#"{"ip":"127.0.0.1","channels":["CAM2"]}"#);
    assert_eq!(status, 200, "{body}");
    let id = body["session"].as_str().unwrap().to_string();
    assert_eq!(body["location"], format!("/sdp/{id}"));

    let (status, sdp) = client.request("GET", &format!("/sdp/{id}"), "");
    assert_eq!(status, 200);
    assert!(sdp.contains("s=Mosaic CAM2\r\n"), "{sdp}");
    assert!(sdp.contains("a=tool:mosaic-rs\r\n"), "{sdp}");

    let session = manager.get_session(&id).unwrap();
    assert!(session.pid().is_some());

    let (status, _) = client.json("DELETE", &format!("/api/sessions/{id}"), "");
    assert_eq!(status, 200);
    assert!(session.pid().is_none());
    assert!(!tmp.path().join(&id).exists());

    server.stop();
    manager.shutdown();
}

/// Encoder script that publishes an SDP, reads one 64x36 frame, then stops
/// reading stdin without exiting.
#[cfg(unix)]
fn stalling_encoder(config: &mut SessionConfig) {
    config.encoder.encoder_program = "sh".to_string();
    config.encoder.rtp_args = vec![
        "-c".to_string(),
        "printf 'v=0\\ns=x\\nt=0 0\\nm=video 5004 RTP/AVP 96\\n' > \"$1\"; head -c 6912 > /dev/null; exec sleep 30"
            .to_string(),
        "sh".to_string(),
        "{sdp}".to_string(),
    ];
    config.encoder.rtp_startup_timeout = Duration::from_secs(5);
    config.encoder.stop_grace = Duration::from_millis(200);
}

#[cfg(unix)]
#[test]
fn stop_is_bounded_when_encoder_stops_reading() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = session_config(tmp.path().to_path_buf());
    stalling_encoder(&mut config);
    config.encoder.write_timeout = Duration::from_secs(30);

    let manager = SessionManager::with_factories(
        config.clone(),
        Arc::new(mosaic::sink::ProcessSinkFactory::new(config.encoder.clone())),
        Arc::new(PatternDecoderFactory::default()),
    )
    .unwrap();
    let target = OutputTarget::rtp("127.0.0.1", Some(5004)).unwrap();
    let session = manager
        .start_session(mosaic::StartRequest::new(target, registry().select(&["CAM1"]).unwrap()))
        .unwrap();
    assert_eq!(session.state(), mosaic::SessionState::Running);

    // Let the pipe fill up behind the stalled reader.
    std::thread::sleep(Duration::from_millis(500));

    let started = std::time::Instant::now();
    assert_eq!(manager.stop_session(&session.id).unwrap(), mosaic::SessionState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(3), "stop took {:?}", started.elapsed());
    assert!(session.pid().is_none());
    assert!(!tmp.path().join(&session.id).exists());
    manager.shutdown();
}

#[cfg(unix)]
#[test]
fn stalled_encoder_fails_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = session_config(tmp.path().to_path_buf());
    stalling_encoder(&mut config);
    config.encoder.write_timeout = Duration::from_millis(300);

    let manager = SessionManager::with_factories(
        config.clone(),
        Arc::new(mosaic::sink::ProcessSinkFactory::new(config.encoder.clone())),
        Arc::new(PatternDecoderFactory::default()),
    )
    .unwrap();
    let target = OutputTarget::rtp("127.0.0.1", Some(5006)).unwrap();
    let session = manager
        .start_session(mosaic::StartRequest::new(target, registry().select(&["CAM2"]).unwrap()))
        .unwrap();

    let state = session.wait(Some(Duration::from_secs(5)));
    assert_eq!(state, mosaic::SessionState::Failed);
    assert!(session.error().is_some_and(|e| e.contains("stdin blocked")), "{:?}", session.error());
    assert!(session.pid().is_none());

    // The target is free again.
    let target = OutputTarget::rtp("127.0.0.1", Some(5006)).unwrap();
    let again = manager.start_session(mosaic::StartRequest::new(target, Vec::new()));
    assert!(again.is_ok());
    manager.shutdown();
}
