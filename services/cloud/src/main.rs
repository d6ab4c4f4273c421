//! mjc-cloud 二进制入口：仅负责初始化日志并分发 CLI。

fn main() -> anyhow::Result<()> {
    mjc_cloud::logging::init();

    let args = std::env::args().skip(1).collect::<Vec<String>>();
    mjc_cloud::cli::dispatch(&args)
}
