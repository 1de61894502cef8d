use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::Encoder;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::shuffle::frame::{BeginRequest, FrameDecoder};

const READ_CHUNK: usize = 64 * 1024;

/// 网络线程 -> 任务线程 的投递项：有数据 / 流结束 / 失败 三种可观测状态
#[derive(Debug)]
pub enum Delivery {
    Frame(Vec<u8>),
    End,
    Failed(String),
}

/// 有界帧队列：满时网络侧 `send().await` 挂起，不丢数据
pub fn frame_queue(capacity: usize) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
    mpsc::channel(capacity.max(1))
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            poll_interval: cfg.connect_poll_interval(),
            queue_capacity: cfg.frame_queue_capacity,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandlerState {
    Idle,
    Streaming,
    Ended,
    Failed,
}

/// 单个连接的消费端
///
/// 同一时刻只允许一个 begin 在途；上一个流必须读完（Ended）才能再次 begin。
pub struct ShuffleClientHandler {
    remote: SocketAddr,
    requests: mpsc::UnboundedSender<BeginRequest>,
    deliveries: mpsc::Receiver<Delivery>,
    state: HandlerState,
    cause: Option<String>,
    io_task: JoinHandle<()>,
}

impl ShuffleClientHandler {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn begin(&mut self, request: BeginRequest) -> Result<()> {
        if self.state == HandlerState::Streaming {
            return Err(EngineError::transport(
                self.remote,
                "begin while the previous stream is not drained",
            ));
        }
        self.cause = None;
        self.state = HandlerState::Streaming;
        if self.requests.send(request).is_err() {
            return Err(self.fail("connection closed".to_string()));
        }
        Ok(())
    }

    /// 阻塞直到：拿到一帧 / 流结束且队列已空（None）/ 失败
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(cause) = &self.cause {
            return Err(EngineError::transport(self.remote, cause.clone()));
        }
        if self.state != HandlerState::Streaming {
            return Ok(None);
        }
        // End 在同一队列中排在所有帧之后，进入 Ended 时已无残留帧
        match self.deliveries.blocking_recv() {
            Some(Delivery::Frame(bytes)) => Ok(Some(bytes)),
            Some(Delivery::End) => {
                self.state = HandlerState::Ended;
                Ok(None)
            }
            Some(Delivery::Failed(msg)) => Err(self.fail(msg)),
            None => Err(self.fail("connection closed".to_string())),
        }
    }

    fn fail(&mut self, msg: String) -> EngineError {
        tracing::warn!("reducer download shuffle read failed from {}: {}", self.remote, msg);
        self.state = HandlerState::Failed;
        self.cause = Some(msg.clone());
        EngineError::transport(self.remote, msg)
    }

    /// 丢弃当前流的剩余帧，让连接回到可 begin 的状态
    fn drain(&mut self) {
        while self.state == HandlerState::Streaming {
            if !matches!(self.next_frame(), Ok(Some(_))) {
                break;
            }
        }
    }

    fn close(&mut self) {
        self.io_task.abort();
        self.deliveries.close();
    }
}

type ConnectSlots = Arc<Mutex<HashMap<SocketAddr, std::result::Result<(), String>>>>;

/// n * n 客户端：每个远端 shuffle 服务一条长连接
///
/// 非线程安全；由单个任务线程持有，整个 job 内复用。
pub struct ShuffleClientManager {
    handlers: Vec<ShuffleClientHandler>,
}

impl ShuffleClientManager {
    /// 为每个不同的 endpoint 建立连接，阻塞轮询直到全部建立；任一失败则返回错误
    pub fn start(runtime: &Handle, endpoints: &[SocketAddr], opts: &ClientOptions) -> Result<Self> {
        let mut distinct: Vec<SocketAddr> = Vec::with_capacity(endpoints.len());
        for ep in endpoints {
            if !distinct.contains(ep) {
                distinct.push(*ep);
            }
        }

        let slots: ConnectSlots = Arc::new(Mutex::new(HashMap::new()));
        let mut handlers = Vec::with_capacity(distinct.len());
        for remote in distinct.iter().copied() {
            let (req_tx, req_rx) = mpsc::unbounded_channel();
            let (frame_tx, frame_rx) = frame_queue(opts.queue_capacity);
            let slots = slots.clone();
            let timeout = opts.connect_timeout;
            let io_task = runtime.spawn(async move {
                let stream = match tokio::time::timeout(timeout, TcpStream::connect(remote)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        slots.lock().insert(remote, Err(e.to_string()));
                        return;
                    }
                    Err(_) => {
                        slots
                            .lock()
                            .insert(remote, Err(format!("connect timed out after {timeout:?}")));
                        return;
                    }
                };
                let _ = stream.set_nodelay(true);
                slots.lock().insert(remote, Ok(()));
                if let Err(e) = pump(stream, req_rx, &frame_tx).await {
                    let _ = frame_tx.send(Delivery::Failed(e.to_string())).await;
                }
            });
            handlers.push(ShuffleClientHandler {
                remote,
                requests: req_tx,
                deliveries: frame_rx,
                state: HandlerState::Idle,
                cause: None,
                io_task,
            });
        }

        let mut manager = Self { handlers };
        loop {
            let filled = slots.lock().len();
            if filled == distinct.len() {
                break;
            }
            // 连接任务已结束却没有登记结果（例如 runtime 正在关闭）：不再等待
            let lost = manager
                .handlers
                .iter()
                .find(|h| h.io_task.is_finished() && !slots.lock().contains_key(&h.remote))
                .map(|h| h.remote);
            if let Some(remote) = lost {
                manager.close();
                return Err(EngineError::transport(
                    remote,
                    "connect task ended before reporting",
                ));
            }
            std::thread::sleep(opts.poll_interval);
        }
        let failed = slots
            .lock()
            .iter()
            .find_map(|(addr, r)| r.as_ref().err().map(|e| (*addr, e.clone())));
        if let Some((addr, e)) = failed {
            manager.close();
            return Err(EngineError::transport(addr, format!("connect failed: {e}")));
        }
        tracing::debug!("shuffle client connected to {} endpoints", distinct.len());
        Ok(manager)
    }

    pub fn handlers(&self) -> &[ShuffleClientHandler] {
        &self.handlers
    }

    /// 对每个连接依次 begin 并拉取，各连接的序列首尾拼接（不交错）
    pub fn read_shuffle_data<T>(
        &mut self,
        shuffle_id: u32,
        reduce_id: u32,
        encoder: Arc<dyn Encoder<T>>,
    ) -> ShuffleRecords<&mut Self, T> {
        ShuffleRecords::new(self, shuffle_id, reduce_id, encoder)
    }

    pub fn close(&mut self) {
        if self.handlers.is_empty() {
            return;
        }
        tracing::info!("close... shuffle client ({} connections)", self.handlers.len());
        for mut h in self.handlers.drain(..) {
            h.close();
        }
    }
}

impl Drop for ShuffleClientManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// 惰性、不可重启的 shuffle 记录序列
///
/// M 可以是 `&mut ShuffleClientManager`，也可以是会话里借出的 `RefMut`。
pub struct ShuffleRecords<M, T>
where
    M: DerefMut<Target = ShuffleClientManager>,
{
    manager: M,
    request: BeginRequest,
    encoder: Arc<dyn Encoder<T>>,
    current: usize,
    begun: bool,
    done: bool,
}

impl<M, T> ShuffleRecords<M, T>
where
    M: DerefMut<Target = ShuffleClientManager>,
{
    pub fn new(manager: M, shuffle_id: u32, reduce_id: u32, encoder: Arc<dyn Encoder<T>>) -> Self {
        Self {
            manager,
            request: BeginRequest::new(shuffle_id, reduce_id),
            encoder,
            current: 0,
            begun: false,
            done: false,
        }
    }
}

impl<M, T> Iterator for ShuffleRecords<M, T>
where
    M: DerefMut<Target = ShuffleClientManager>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        loop {
            let Some(handler) = self.manager.handlers.get_mut(self.current) else {
                self.done = true;
                return None;
            };
            if !self.begun {
                if let Err(e) = handler.begin(self.request) {
                    self.done = true;
                    return Some(Err(e));
                }
                self.begun = true;
            }
            match handler.next_frame() {
                Ok(Some(bytes)) => {
                    let decoded = self.encoder.decode(&bytes);
                    if decoded.is_err() {
                        self.done = true;
                    }
                    return Some(decoded);
                }
                Ok(None) => {
                    self.current += 1;
                    self.begun = false;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<M, T> Drop for ShuffleRecords<M, T>
where
    M: DerefMut<Target = ShuffleClientManager>,
{
    fn drop(&mut self) {
        if self.begun {
            if let Some(h) = self.manager.handlers.get_mut(self.current) {
                h.drain();
            }
        }
    }
}

async fn pump(
    mut stream: TcpStream,
    mut requests: mpsc::UnboundedReceiver<BeginRequest>,
    frames: &mpsc::Sender<Delivery>,
) -> Result<()> {
    let remote = stream.peer_addr()?;
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    while let Some(req) = requests.recv().await {
        stream.write_all(&req.encode()).await?;
        'response: loop {
            // 先交出缓冲区里的完整帧；-1 只结束本轮扫描
            loop {
                let out = decoder.decode()?;
                let progressed = !out.frames.is_empty() || out.batch_stopped;
                for f in out.frames {
                    if frames.send(Delivery::Frame(f)).await.is_err() {
                        return Ok(());
                    }
                }
                if out.end_of_stream {
                    if frames.send(Delivery::End).await.is_err() {
                        return Ok(());
                    }
                    break 'response;
                }
                if !progressed {
                    break;
                }
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(EngineError::transport(
                    remote,
                    "connection closed before end of stream",
                ));
            }
            decoder.extend(&chunk[..n]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeEncoder;
    use crate::shuffle::server::{ShuffleServer, ShuffleServerHandle};
    use crate::shuffle::writer::ShuffleWriter;
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mpp-rdd-client-{}-{}", tag, nanos))
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn encoder() -> Arc<dyn Encoder<(u32, String)>> {
        Arc::new(BincodeEncoder::<(u32, String)>::new())
    }

    /// 在 root 下为 (shuffle 1, reduce 0) 写 maps 个 map 输出，每个 per_map 条
    fn seed(root: &PathBuf, tag: u32, maps: usize, per_map: usize) {
        let enc = encoder();
        let writer = ShuffleWriter::new(root);
        for m in 0..maps {
            let mut bucket = Vec::new();
            for i in 0..per_map {
                let mut buf = Vec::new();
                enc.encode(&(tag, format!("m{m}-r{i}")), &mut buf).unwrap();
                bucket.push(buf);
            }
            writer.write_map_output(1, m, &[bucket]).unwrap();
        }
    }

    fn serve(rt: &tokio::runtime::Runtime, root: &PathBuf, batch: usize) -> ShuffleServerHandle {
        ShuffleServer::spawn(rt.handle(), "127.0.0.1:0".parse().unwrap(), root, batch).unwrap()
    }

    #[test]
    fn reads_every_record_from_every_endpoint() {
        let rt = runtime();
        let mut servers = Vec::new();
        let mut roots = Vec::new();
        for tag in 0..3u32 {
            let root = unique_tmp_dir(&format!("n{tag}"));
            seed(&root, tag, 2, 50);
            servers.push(serve(&rt, &root, 7));
            roots.push(root);
        }
        let addrs: Vec<SocketAddr> = servers.iter().map(|s| s.addr()).collect();

        let mut mgr = ShuffleClientManager::start(rt.handle(), &addrs, &ClientOptions::default()).unwrap();
        assert_eq!(mgr.handlers().len(), 3);

        let got: Vec<(u32, String)> = mgr
            .read_shuffle_data(1, 0, encoder())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got.len(), 3 * 100);
        let mut distinct = got.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), got.len());
        // 按连接拼接：同一 endpoint 的记录连续出现
        let tags: Vec<u32> = got.iter().map(|(t, _)| *t).collect();
        let switches = tags.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 2);

        // 连接复用：第二次读取同一连接，空 reduce 直接结束
        assert_eq!(mgr.read_shuffle_data(1, 5, encoder()).count(), 0);
        assert!(mgr.handlers().iter().all(|h| h.state() == HandlerState::Ended));

        mgr.close();
        mgr.close();
        for r in roots {
            let _ = std::fs::remove_dir_all(r);
        }
    }

    #[test]
    fn tiny_queue_applies_backpressure_without_loss() {
        let rt = runtime();
        let root = unique_tmp_dir("tiny");
        seed(&root, 9, 1, 500);
        let server = serve(&rt, &root, 3);

        let opts = ClientOptions {
            queue_capacity: 2,
            ..ClientOptions::default()
        };
        let mut mgr = ShuffleClientManager::start(rt.handle(), &[server.addr()], &opts).unwrap();
        let mut n = 0;
        for r in mgr.read_shuffle_data(1, 0, encoder()) {
            r.unwrap();
            n += 1;
            if n % 100 == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(n, 500);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn full_queue_rejects_rather_than_grows() {
        let (tx, mut rx) = frame_queue(2);
        tx.try_send(Delivery::Frame(vec![1])).unwrap();
        tx.try_send(Delivery::Frame(vec![2])).unwrap();
        assert!(tx.try_send(Delivery::Frame(vec![3])).is_err());
        assert!(matches!(rx.try_recv(), Ok(Delivery::Frame(b)) if b == vec![1]));
        assert!(tx.try_send(Delivery::Frame(vec![3])).is_ok());
    }

    #[test]
    fn partially_consumed_stream_is_drained_before_next_begin() {
        let rt = runtime();
        let root = unique_tmp_dir("drain");
        seed(&root, 1, 1, 40);
        let server = serve(&rt, &root, 4);

        let mut mgr = ShuffleClientManager::start(rt.handle(), &[server.addr()], &ClientOptions::default()).unwrap();
        let first: Vec<_> = mgr.read_shuffle_data(1, 0, encoder()).take(3).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(mgr.read_shuffle_data(1, 0, encoder()).count(), 40);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn truncated_stream_surfaces_transport_error() {
        let rt = runtime();
        // 读完 begin 后只写半个帧就断开
        let listener = rt
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        rt.spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 8];
            s.read_exact(&mut req).await.unwrap();
            s.write_all(&10i32.to_be_bytes()).await.unwrap();
            s.write_all(b"abc").await.unwrap();
        });

        let mut mgr = ShuffleClientManager::start(rt.handle(), &[addr], &ClientOptions::default()).unwrap();
        let mut it = mgr.read_shuffle_data(1, 0, encoder());
        let first = it.next().unwrap();
        assert!(matches!(first, Err(EngineError::Transport { .. })));
        assert!(it.next().is_none());
        drop(it);
        assert_eq!(mgr.handlers()[0].state(), HandlerState::Failed);
    }

    #[test]
    fn unreachable_endpoint_fails_start() {
        let rt = runtime();
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = ShuffleClientManager::start(rt.handle(), &[addr], &ClientOptions::default());
        assert!(matches!(err, Err(EngineError::Transport { .. })));
    }

    #[test]
    fn start_returns_when_runtime_is_gone() {
        let rt = runtime();
        let handle = rt.handle().clone();
        rt.shutdown_background();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = ShuffleClientManager::start(&handle, &[addr], &ClientOptions::default());
        assert!(matches!(err, Err(EngineError::Transport { .. })));
    }

    #[test]
    fn begin_while_streaming_is_rejected() {
        let rt = runtime();
        let root = unique_tmp_dir("twice");
        seed(&root, 1, 1, 10);
        let server = serve(&rt, &root, 4);

        let mut mgr = ShuffleClientManager::start(rt.handle(), &[server.addr()], &ClientOptions::default()).unwrap();
        let h = &mut mgr.handlers[0];
        h.begin(BeginRequest::new(1, 0)).unwrap();
        assert!(h.begin(BeginRequest::new(1, 0)).is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
