use greeter::Variant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    greeter::run(Variant::Server).await
}
