//! TCP broadcast server.
//!
//! One OS thread runs a current-thread tokio runtime: an accept task, a
//! reader and writer task per client, and the wakeup dispatcher. Command
//! execution and all catalog mutation happen on this thread; the pipeline
//! only pokes the wakeup channel. Byte codes on the channel mirror the
//! classic self-pipe protocol: depth ready, video ready, kill.
//!
//! The listener is dual-stack; IPv4 peers appear as IPv4-mapped IPv6
//! addresses and are rendered dotted-quad in logs.

mod client;
mod commands;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

use crate::error::Result;
use crate::pipeline::{FpsCounter, FrameBuffer, PipelineState};
use crate::zone::ZoneCatalog;
use client::{format_zone_info, Client, Outbound};

/// Largest command line a client may send without a terminator.
const MAX_BUFFER_SIZE: usize = 131072;

/// Everything the command handlers and the wakeup dispatcher touch.
pub struct ServerContext {
    pub catalog: Arc<ZoneCatalog>,
    pub pipeline: Arc<PipelineState>,
    pub depth: Arc<FrameBuffer>,
    pub video: Arc<FrameBuffer>,
    pub fps: Arc<FpsCounter>,
}

enum Wake {
    Depth,
    Video,
    Kill,
}

/// Cloneable handle for waking the server from pipeline threads.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Wake>,
}

impl ServerHandle {
    /// Call when a depth frame has been processed.
    pub fn notify_depth(&self) {
        let _ = self.tx.send(Wake::Depth);
    }

    /// Call when a video frame has been processed.
    pub fn notify_video(&self) {
        let _ = self.tx.send(Wake::Video);
    }

    fn kill(&self) {
        let _ = self.tx.send(Wake::Kill);
    }
}

pub(crate) struct ServerInner {
    pub(crate) ctx: ServerContext,
    clients: Mutex<Vec<Arc<Client>>>,
}

impl ServerInner {
    pub(crate) fn registry_snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().expect("client list lock poisoned").clone()
    }

    fn add_client(&self, client: Arc<Client>) {
        self.clients.lock().expect("client list lock poisoned").push(client);
    }

    fn remove_client(&self, id: u64) {
        self.clients
            .lock()
            .expect("client list lock poisoned")
            .retain(|c| c.id != id);
    }
}

pub struct Server {
    inner: Arc<ServerInner>,
    handle: ServerHandle,
    local_addr: SocketAddr,
    listener: Option<std::net::TcpListener>,
    rx: Option<mpsc::UnboundedReceiver<Wake>>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listening socket. Call [`Server::run`] shortly afterwards;
    /// connections queue up from this point on.
    pub fn create(ctx: ServerContext, port: u16) -> Result<Server> {
        let listener = std::net::TcpListener::bind(("::", port)).or_else(|e| {
            tracing::warn!("IPv6 listener unavailable ({e}); falling back to IPv4");
            std::net::TcpListener::bind(("0.0.0.0", port))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Server {
            inner: Arc::new(ServerInner { ctx, clients: Mutex::new(Vec::new()) }),
            handle: ServerHandle { tx },
            local_addr,
            listener: Some(listener),
            rx: Some(rx),
            thread: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Starts the event loop in a newly created thread.
    pub fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().expect("server already running");
        let rx = self.rx.take().expect("server already running");
        let inner = self.inner.clone();

        let thread = std::thread::Builder::new().name("kndsrv".into()).spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Error initializing server event loop: {e}");
                    return;
                }
            };

            rt.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!("Error adopting listening socket: {e}");
                        return;
                    }
                };

                let accept_inner = inner.clone();
                tokio::spawn(accept_loop(listener, accept_inner));
                wake_loop(rx, inner).await;
            });
            // Dropping the runtime tears down all client tasks.
        })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stops the event loop and waits for the server thread to exit.
    pub fn stop(&mut self) {
        self.handle.kill();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

/// Renders a peer address, unwrapping IPv4-mapped IPv6 to dotted quad.
fn render_addr(peer: SocketAddr) -> (String, u16) {
    let addr = match peer.ip() {
        std::net::IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => format!("[{v6}]"),
        },
        std::net::IpAddr::V4(v4) => v4.to_string(),
    };
    (addr, peer.port())
}

async fn accept_loop(listener: tokio::net::TcpListener, inner: Arc<ServerInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let (addr, port) = render_addr(peer);
                tracing::info!("Client {addr}:{port} connected");

                let (client, out_rx) = Client::new(addr, port);
                let client = Arc::new(client);
                inner.add_client(client.clone());

                let (read_half, write_half) = stream.into_split();
                tokio::spawn(client_writer(write_half, out_rx));
                tokio::spawn(client_reader(read_half, client, inner.clone()));
            }
            Err(e) => {
                tracing::error!("Error accepting an incoming connection: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn client_reader(read_half: OwnedReadHalf, client: Arc<Client>, inner: Arc<ServerInner>) {
    let codec =
        AnyDelimiterCodec::new_with_max_length(vec![b'\r', b'\n'], vec![b'\n'], MAX_BUFFER_SIZE);
    let mut lines = FramedRead::new(read_half, codec);

    while let Some(item) = lines.next().await {
        match item {
            Ok(chunk) => {
                // Ignore data once the client is queued for shutdown.
                if client.subs().shutdown_requested {
                    continue;
                }
                if chunk.is_empty() {
                    continue;
                }
                match std::str::from_utf8(&chunk) {
                    Ok(line) => commands::dispatch(&inner, &client, line),
                    Err(_) => client.send_str("ERR - Unknown command\n"),
                }
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::error!(
                    "Client {}:{} buffer is full.  Closing connection.",
                    client.addr,
                    client.port
                );
                client.send_str("\n\n\nBuffer overflow.\n\n\n");
                client.request_shutdown();
                break;
            }
            Err(AnyDelimiterCodecError::Io(e)) => {
                tracing::error!("A socket error occurred on {}:{}: {e}", client.addr, client.port);
                break;
            }
        }
    }

    tracing::info!("Client {}:{} disconnected", client.addr, client.port);
    inner.remove_client(client.id);
}

async fn client_writer(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Outbound::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

/// Drains the wakeup channel and fans pipeline events out to subscribers.
async fn wake_loop(mut rx: mpsc::UnboundedReceiver<Wake>, inner: Arc<ServerInner>) {
    while let Some(first) = rx.recv().await {
        let mut depth_count = 0usize;
        let mut video_count = 0usize;
        let mut kill = false;

        let mut pending = vec![first];
        while let Ok(w) = rx.try_recv() {
            pending.push(w);
        }
        for wake in pending {
            match wake {
                Wake::Depth => depth_count += 1,
                Wake::Video => video_count += 1,
                Wake::Kill => kill = true,
            }
        }

        if kill {
            break;
        }
        if depth_count > 0 {
            process_depth_wake(&inner);
        }
        if video_count > 0 {
            process_video_wake(&inner);
        }
    }
}

/// Pushes differential SUB lines and any subscribed depth frames, then
/// snapshots the catalog state for the next differential pass.
fn process_depth_wake(inner: &Arc<ServerInner>) {
    let clients = inner.registry_snapshot();
    let mut depth_blob: Option<Bytes> = None;

    for client in &clients {
        let (global, wants_depth) = {
            let mut subs = client.subs();
            let global = subs.global;
            let mut wants_depth = false;
            if subs.depth {
                wants_depth = true;
                if subs.depth_limit > 0 {
                    subs.depth_limit -= 1;
                    if subs.depth_limit == 0 {
                        subs.depth = false;
                    }
                }
            }
            (global, wants_depth)
        };

        if global {
            // Pop rarely stays frozen while anything else changes, but
            // occupied can flip long after pop settles because of the
            // rising/falling delay logic, so check it too.
            let mut out = String::new();
            inner.ctx.catalog.for_each(|z| {
                if z.lastpop != z.pop || z.lastoccupied != z.occupied || z.new_zone {
                    out.push_str("SUB - ");
                    out.push_str(&format_zone_info(z, z.new_zone));
                }
            });
            if !out.is_empty() {
                client.send_str(out);
            }
        }

        if wants_depth {
            let blob = depth_blob
                .get_or_insert_with(|| inner.ctx.depth.snapshot())
                .clone();
            inner.ctx.pipeline.mark_depth_pull();
            client.send_str(format!(
                "DEPTH - {} bytes of raw data follow newline\n",
                blob.len()
            ));
            client.send_bytes(blob);
        }
    }

    inner.ctx.catalog.touch();
}

/// Pushes one-shot brightness lines and subscribed video frames.
fn process_video_wake(inner: &Arc<ServerInner>) {
    let clients = inner.registry_snapshot();
    let mut video_blob: Option<Bytes> = None;

    for client in &clients {
        let (bright, video) = {
            let mut subs = client.subs();
            let pair = (subs.bright, subs.video);
            subs.bright = false;
            subs.video = false;
            pair
        };

        if bright {
            let mut out = String::new();
            inner.ctx.catalog.for_each(|z| {
                out.push_str(&format!(
                    "BRIGHT - bright={} name=\"{}\"\n",
                    z.bright(),
                    z.name
                ));
            });
            client.send_str(out);
        }

        if video {
            let blob = video_blob
                .get_or_insert_with(|| inner.ctx.video.snapshot())
                .clone();
            inner.ctx.pipeline.mark_video_pull();
            client.send_str(format!(
                "VIDEO - {} bytes of video data follow newline\n",
                blob.len()
            ));
            client.send_bytes(blob);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use crate::{DEPTH_SIZE, VIDEO_SIZE};

    struct TestServer {
        server: Server,
        catalog: Arc<ZoneCatalog>,
        pipeline: Arc<PipelineState>,
        depth: Arc<FrameBuffer>,
    }

    fn start_server() -> TestServer {
        crate::lut::init();
        let catalog = Arc::new(ZoneCatalog::new(2, 2));
        let pipeline = PipelineState::new();
        let depth = Arc::new(FrameBuffer::new(DEPTH_SIZE));
        let video = Arc::new(FrameBuffer::new(VIDEO_SIZE));
        let fps = Arc::new(FpsCounter::new());

        let ctx = ServerContext {
            catalog: catalog.clone(),
            pipeline: pipeline.clone(),
            depth: depth.clone(),
            video: video.clone(),
            fps,
        };
        let mut server = Server::create(ctx, 0).unwrap();
        server.run().unwrap();
        TestServer { server, catalog, pipeline, depth }
    }

    fn connect(server: &Server) -> (TcpStream, BufReader<TcpStream>) {
        let addr = server.local_addr();
        let stream = TcpStream::connect(("::1", addr.port()))
            .or_else(|_| TcpStream::connect(("127.0.0.1", addr.port())))
            .unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn send(stream: &mut TcpStream, line: &str) {
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    #[test]
    fn test_basic_commands() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "ver");
        assert_eq!(read_line(&mut reader), "OK - Version 2");

        send(&mut stream, "bogus");
        assert_eq!(read_line(&mut reader), "ERR - Unknown command");

        send(&mut stream, "help");
        let head = read_line(&mut reader);
        assert!(head.starts_with("OK - 19 commands"), "{head}");
        for _ in 0..19 {
            let line = read_line(&mut reader);
            assert!(line.contains(" - "), "{line}");
        }

        send(&mut stream, "fps");
        assert_eq!(read_line(&mut reader), "OK - 0 fps");

        ts.server.stop();
    }

    #[test]
    fn test_zone_lifecycle() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "addzone Living,1,1,1,2,2,2");
        assert_eq!(read_line(&mut reader), "OK - Zone \"Living\" was added.");

        send(&mut stream, "zones");
        let head = read_line(&mut reader);
        assert!(head.starts_with("OK - 1 zones - Version "), "{head}");
        let zone_line = read_line(&mut reader);
        assert!(zone_line.contains("xmin=1 ymin=1 zmin=1 xmax=2 ymax=2 zmax=2"), "{zone_line}");
        assert!(zone_line.contains("name=\"Living\""), "{zone_line}");
        // maxpop is the screen-box area and never 0.
        assert!(!zone_line.contains("maxpop=0 "), "{zone_line}");

        // Case-insensitive uniqueness.
        send(&mut stream, "addzone living,3,3,3,4,4,4");
        assert_eq!(read_line(&mut reader), "ERR - Zone \"living\" already exists.");

        send(&mut stream, "setzone Living,xmin,-50");
        assert_eq!(
            read_line(&mut reader),
            "OK - Zone \"Living\" attribute \"xmin\" was updated."
        );

        send(&mut stream, "setzone Living,all,-10,-10,500,10,10,900");
        assert_eq!(read_line(&mut reader), "OK - Zone \"Living\" was updated.");

        send(&mut stream, "setzone Nothere,xmin,1");
        assert_eq!(read_line(&mut reader), "ERR - Zone \"Nothere\" does not exist.");

        send(&mut stream, "rmzone Living");
        assert_eq!(read_line(&mut reader), "OK - Zone \"Living\" was removed.");
        send(&mut stream, "rmzone Living");
        assert_eq!(read_line(&mut reader), "ERR - Zone \"Living\" not found.");

        ts.server.stop();
    }

    #[test]
    fn test_threshold_clamp_over_wire() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "addzone Z,1,1,1,2,2,2");
        read_line(&mut reader);
        send(&mut stream, "setzone Z,param,bright");
        read_line(&mut reader);
        send(&mut stream, "setzone Z,on_level,400");
        read_line(&mut reader);
        send(&mut stream, "setzone Z,off_level,500");
        read_line(&mut reader);

        send(&mut stream, "zones");
        read_line(&mut reader);
        let line = read_line(&mut reader);
        assert!(line.contains("on_level=500 off_level=500"), "{line}");

        ts.server.stop();
    }

    #[test]
    fn test_sub_and_depth_wakeup() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "addzone A,1,1,1,2,2,2");
        read_line(&mut reader);
        send(&mut stream, "addzone B,5,5,5,6,6,6");
        read_line(&mut reader);

        send(&mut stream, "sub");
        assert_eq!(read_line(&mut reader), "OK - Subscribed to global zone updates");
        let s1 = read_line(&mut reader);
        let s2 = read_line(&mut reader);
        assert!(s1.starts_with("SUB - ") && s1.contains("name=\"A\""), "{s1}");
        assert!(s2.starts_with("SUB - ") && s2.contains("name=\"B\""), "{s2}");

        // Both zones still carry new_zone, so a depth wakeup announces both
        // in full form, then the catalog is touched.
        ts.server.handle().notify_depth();
        let s1 = read_line(&mut reader);
        let s2 = read_line(&mut reader);
        assert!(s1.starts_with("SUB - xmin="), "{s1}");
        assert!(s2.starts_with("SUB - xmin="), "{s2}");

        // Nothing changed since the touch: the next wakeup emits nothing.
        ts.server.handle().notify_depth();
        std::thread::sleep(Duration::from_millis(100));
        send(&mut stream, "ver");
        assert_eq!(read_line(&mut reader), "OK - Version 2");

        ts.server.stop();
    }

    #[test]
    fn test_getdepth_delivers_blob() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        ts.depth.produce(&vec![0xabu8; DEPTH_SIZE], 0, None);

        send(&mut stream, "getdepth");
        assert_eq!(
            read_line(&mut reader),
            "OK - Requested a single depth frame for delivery as a DEPTH message"
        );

        ts.server.handle().notify_depth();
        assert_eq!(
            read_line(&mut reader),
            format!("DEPTH - {DEPTH_SIZE} bytes of raw data follow newline")
        );
        let mut blob = vec![0u8; DEPTH_SIZE];
        reader.read_exact(&mut blob).unwrap();
        assert!(blob.iter().all(|&b| b == 0xab));

        // One-shot: a second wakeup must not send another frame.
        ts.server.handle().notify_depth();
        std::thread::sleep(Duration::from_millis(100));
        send(&mut stream, "ver");
        assert_eq!(read_line(&mut reader), "OK - Version 2");

        ts.server.stop();
    }

    #[test]
    fn test_subdepth_count_limit() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "subdepth 2");
        assert_eq!(
            read_line(&mut reader),
            "OK - 2 depth frame(s) will be delivered as DEPTH messages"
        );

        for _ in 0..2 {
            ts.server.handle().notify_depth();
            assert!(read_line(&mut reader).starts_with("DEPTH - "));
            let mut blob = vec![0u8; DEPTH_SIZE];
            reader.read_exact(&mut blob).unwrap();
        }

        // Count exhausted; no further frames arrive.
        ts.server.handle().notify_depth();
        send(&mut stream, "unsubdepth");
        assert_eq!(read_line(&mut reader), "ERR - Not subscribed to depth data");

        ts.server.stop();
    }

    #[test]
    fn test_getbright_and_video() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "addzone Z,1,1,1,2,2,2");
        read_line(&mut reader);

        send(&mut stream, "getbright");
        assert_eq!(read_line(&mut reader), "OK - Requested brightness for each zone");
        assert!(ts.pipeline.video_requested(), "getbright requests video capture");

        ts.server.handle().notify_video();
        let line = read_line(&mut reader);
        assert!(line.starts_with("BRIGHT - bright=") && line.contains("name=\"Z\""), "{line}");

        send(&mut stream, "getvideo");
        assert_eq!(read_line(&mut reader), "OK - Requested delivery of a video frame");
        ts.server.handle().notify_video();
        assert_eq!(
            read_line(&mut reader),
            format!("VIDEO - {VIDEO_SIZE} bytes of video data follow newline")
        );
        let mut blob = vec![0u8; VIDEO_SIZE];
        reader.read_exact(&mut blob).unwrap();

        ts.server.stop();
    }

    #[test]
    fn test_tilt_command() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "tilt 20");
        assert_eq!(read_line(&mut reader), "OK - Requested tilt of 15 degrees");
        assert_eq!(ts.pipeline.tilt(), 15);

        send(&mut stream, "tilt");
        assert_eq!(read_line(&mut reader), "OK - Current tilt is 15 degrees");

        send(&mut stream, "tilt 1,2,3");
        assert_eq!(read_line(&mut reader), "ERR - Too many arguments (expected 0 or 1)");

        ts.server.stop();
    }

    #[test]
    fn test_lut_commands() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "lut 600");
        let line = read_line(&mut reader);
        assert_eq!(line, format!("OK - 600 -> {}mm.", crate::lut::depth_mm(600)));

        send(&mut stream, "lut 5000");
        assert_eq!(
            read_line(&mut reader),
            "ERR - Raw distance value 5000 is out of range (0-2047)."
        );

        send(&mut stream, "lut");
        assert_eq!(read_line(&mut reader), "OK - 2048 lines follow");
        for i in 0..2048 {
            let line = read_line(&mut reader);
            assert_eq!(line, crate::lut::depth_mm(i).to_string());
        }

        send(&mut stream, "sa 600");
        let line = read_line(&mut reader);
        assert!(line.starts_with("OK - 600 -> "), "{line}");
        assert!(line.ends_with("mm^2."), "{line}");

        ts.server.stop();
    }

    #[test]
    fn test_bye_drains_then_closes() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        send(&mut stream, "bye");
        assert_eq!(read_line(&mut reader), "OK - Goodbye");
        let mut rest = String::new();
        // EOF after the goodbye drains.
        reader.read_to_string(&mut rest).unwrap();
        assert!(rest.is_empty());

        ts.server.stop();
    }

    #[test]
    fn test_cr_terminates_lines() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);

        stream.write_all(b"ver\rver\r\nver\n").unwrap();
        for _ in 0..3 {
            assert_eq!(read_line(&mut reader), "OK - Version 2");
        }

        ts.server.stop();
    }

    #[test]
    fn test_del_broadcast_to_subscriber() {
        let mut ts = start_server();
        let (mut stream, mut reader) = connect(&ts.server);
        let (mut other, mut other_reader) = connect(&ts.server);

        send(&mut stream, "addzone Z,1,1,1,2,2,2");
        read_line(&mut reader);

        send(&mut other, "sub");
        read_line(&mut other_reader); // OK
        read_line(&mut other_reader); // SUB line for Z

        // Removal announces DEL to the subscriber, not to the remover.
        send(&mut stream, "rmzone Z");
        assert_eq!(read_line(&mut reader), "OK - Zone \"Z\" was removed.");
        assert_eq!(read_line(&mut other_reader), "DEL - Z");

        assert_eq!(ts.catalog.len(), 0);
        ts.server.stop();
    }
}
