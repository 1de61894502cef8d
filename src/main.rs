use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mpp_rdd::shuffle::{FnPartitioner, ShuffleServer};
use mpp_rdd::{Dataset, EngineConfig, MppContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpp-rdd", version, about = "Local MPP engine over a lazy dataset graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 运行示例 job：按奇偶 shuffle 到两个 reduce 分区并计数
    Run {
        /// TOML 配置文件；缺省读取 <config_dir>/mpp-rdd/config.toml
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        parallelism: Option<i32>,
        #[arg(long, default_value_t = 1000)]
        records: u64,
        #[arg(long, default_value_t = 4)]
        partitions: usize,
        #[arg(long, default_value_t = 2)]
        reducers: usize,
    },
    /// 只启动 shuffle 服务，供其他节点读取本地 map 输出
    Serve {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "127.0.0.1:7337")]
        bind: SocketAddr,
        #[arg(long, default_value_t = 64)]
        batch_frames: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            parallelism,
            records,
            partitions,
            reducers,
        } => run(config, parallelism, records, partitions, reducers),
        Command::Serve {
            dir,
            bind,
            batch_frames,
        } => serve(dir, bind, batch_frames),
    }
}

fn run(
    config: Option<PathBuf>,
    parallelism: Option<i32>,
    records: u64,
    partitions: usize,
    reducers: usize,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::load_or_default()?,
    };
    let ctx = MppContext::new(config)?;
    if let Some(n) = parallelism {
        ctx.set_parallelism(n)?;
    }
    anyhow::ensure!(reducers > 0, "reducers must be > 0");

    let modulus = reducers as u64;
    let job = Dataset::parallelize((0..records).collect(), partitions.max(1))
        .key_by(move |v| v % modulus)
        .partition_by(Arc::new(FnPartitioner::<u64, _>::new(reducers, |k: &u64| *k)));

    let counts = ctx.run_job(&job, |it| it.count())?;
    for (reducer, count) in counts.iter().enumerate() {
        println!("reducer {reducer}: {count} records");
    }
    if let Some(stats) = ctx.last_job_stats() {
        println!("{stats}");
    }
    Ok(())
}

fn serve(dir: PathBuf, bind: SocketAddr, batch_frames: usize) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mpp-rdd-serve")
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = ShuffleServer::bind(bind, dir.clone(), batch_frames).await?;
        info!("serving shuffle data from {:?} on {}", dir, server.local_addr()?);

        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                let _ = tx.send(());
            }
        });
        server.run(rx).await?;
        Ok(())
    })
}
