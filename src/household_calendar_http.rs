use log::error;

use household_calendar_http::app::start_app;

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = start_app().await {
        error!("{e}");
        std::process::exit(1);
    }
}
