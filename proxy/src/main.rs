#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cli;
mod healthz;
mod listen;
mod wormhole;

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(feature = "rustls-tls")]
    {
        if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
            anyhow::bail!("no other crypto provider should be installed yet");
        }
    }
    cli::Args::parse_and_run().await
}
