#[tokio::main]
async fn main() {
    if let Err(e) = guided_fix_lib::run().await {
        eprintln!("guided-fix: {e}");
        std::process::exit(1);
    }
}
