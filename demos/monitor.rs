use myq_cloud::MyQClient;
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> myq_cloud::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let username = args
        .get(1)
        .cloned()
        .or_else(|| env::var("MYQ_USERNAME").ok())
        .expect("usage: monitor <username> <password> (or MYQ_USERNAME/MYQ_PASSWORD)");
    let password = args
        .get(2)
        .cloned()
        .or_else(|| env::var("MYQ_PASSWORD").ok())
        .expect("usage: monitor <username> <password> (or MYQ_USERNAME/MYQ_PASSWORD)");

    let builder = MyQClient::builder(username, password).on_event(|event| {
        println!("{event:?}");
    });

    println!("Logging in...");
    let client = MyQClient::login(builder).await?;
    for (id, device) in client.devices() {
        println!(
            "[{id}] {} {:?} | state: {} | online: {}",
            device.name,
            device.kind,
            device.current_state().unwrap_or("unknown"),
            device.online(),
        );
    }
    println!("Polling for updates...");

    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if let Err(e) = client.update_device_info().await {
            eprintln!("Update error: {e}");
            if e.is_credentials_problem() {
                return Err(e);
            }
        }
    }
}
