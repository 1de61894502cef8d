use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{EngineError, Result};
use crate::shuffle::frame::{
    split_frames, write_frame, write_marker, BeginRequest, BATCH_STOP, BEGIN_REQUEST_LEN,
    END_OF_STREAM,
};
use crate::shuffle::layout::map_outputs_for_reduce;

/// shuffle 服务端：按 begin 请求把本地已物化的 map 输出推给 reduce 端
pub struct ShuffleServer {
    listener: TcpListener,
    root: Arc<PathBuf>,
    batch_frames: usize,
}

impl ShuffleServer {
    pub async fn bind(addr: SocketAddr, root: impl Into<PathBuf>, batch_frames: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            root: Arc::new(root.into()),
            batch_frames: batch_frames.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 在给定 runtime 上启动，返回的 handle drop 时停止服务
    pub fn spawn(
        runtime: &Handle,
        addr: SocketAddr,
        root: impl Into<PathBuf>,
        batch_frames: usize,
    ) -> Result<ShuffleServerHandle> {
        let server = runtime.block_on(Self::bind(addr, root, batch_frames))?;
        let addr = server.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let task = runtime.spawn(async move {
            if let Err(e) = server.run(rx).await {
                tracing::error!("shuffle server {} stopped: {}", addr, e);
            }
        });
        tracing::info!("shuffle server listening on {}", addr);
        Ok(ShuffleServerHandle {
            addr,
            runtime: runtime.clone(),
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let root = self.root.clone();
                    let batch = self.batch_frames;
                    conns.spawn(async move {
                        if let Err(e) = serve_connection(socket, root, batch).await {
                            tracing::warn!("shuffle connection {} failed: {}", peer, e);
                        }
                    });
                }
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
        conns.abort_all();
        Ok(())
    }
}

pub struct ShuffleServerHandle {
    addr: SocketAddr,
    runtime: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ShuffleServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// 停止服务；在 runtime 之外 drop 时等到监听端口真正释放才返回
impl Drop for ShuffleServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            tracing::debug!("shuffle server {} shutting down", self.addr);
        }
        if let Some(task) = self.task.take() {
            if Handle::try_current().is_err() {
                let _ = self.runtime.block_on(task);
            }
        }
    }
}

async fn serve_connection(mut socket: TcpStream, root: Arc<PathBuf>, batch_frames: usize) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut req = [0u8; BEGIN_REQUEST_LEN];
    loop {
        match socket.read_exact(&mut req).await {
            Ok(_) => {}
            // 客户端 close：正常结束
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let begin = BeginRequest::decode(&req)?;
        let sent = stream_partition(&mut socket, &root, begin, batch_frames).await?;
        tracing::debug!(
            "served shuffle {} reduce {}: {} frames",
            begin.shuffle_id,
            begin.reduce_id,
            sent
        );
    }
}

async fn stream_partition(
    socket: &mut TcpStream,
    root: &Path,
    begin: BeginRequest,
    batch_frames: usize,
) -> Result<usize> {
    let files = {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            map_outputs_for_reduce(&root, begin.shuffle_id, begin.reduce_id)
        })
        .await
        .map_err(|e| EngineError::transport("local", e.to_string()))??
    };

    let mut sent = 0usize;
    for path in files {
        let bytes = tokio::fs::read(&path).await?;
        let frames = split_frames(&bytes)?;
        for batch in frames.chunks(batch_frames) {
            let mut buf = Vec::with_capacity(batch.iter().map(|f| f.len() + 4).sum::<usize>() + 4);
            for f in batch {
                write_frame(&mut buf, f)?;
            }
            write_marker(&mut buf, BATCH_STOP)?;
            socket.write_all(&buf).await?;
            sent += batch.len();
        }
    }
    socket.write_all(&END_OF_STREAM.to_be_bytes()).await?;
    socket.flush().await?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::frame::FrameDecoder;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mpp-rdd-server-{}-{}", tag, nanos))
    }

    fn free_port() -> SocketAddr {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    #[test]
    fn dropped_handle_releases_fixed_port() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let root = unique_tmp_dir("port");
        let addr = free_port();
        for _ in 0..20 {
            let server = ShuffleServer::spawn(rt.handle(), addr, root.as_path(), 4).unwrap();
            assert_eq!(server.addr(), addr);
            drop(server);
        }
    }

    #[test]
    fn missing_shuffle_yields_empty_stream() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let root = unique_tmp_dir("empty");
        let server = ShuffleServer::spawn(rt.handle(), free_port(), root.as_path(), 4).unwrap();
        let addr = server.addr();
        let out = rt.block_on(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(&BeginRequest::new(3, 0).encode()).await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut decoder = FrameDecoder::new();
        decoder.extend(&out);
        let decoded = decoder.decode().unwrap();
        assert!(decoded.frames.is_empty());
        assert!(decoded.end_of_stream);
    }
}
