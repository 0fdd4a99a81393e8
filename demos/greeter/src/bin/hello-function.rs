use greeter::Variant;

// Serverless hosts forward invocations to FUNCTIONS_CUSTOMHANDLER_PORT and may
// freeze the process between them, so spans and logs are flushed per request.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    greeter::run(Variant::Function).await
}
