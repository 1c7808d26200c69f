use std::time::Duration;

use log::{info, warn};
use service_methods::broker::BrokerConfig;
use service_methods::handler::{handler_fn, Invocation, MethodTable};
use service_methods::{BrokerEvent, MethodError, Payload, StartParameters};
use tokio_stream::StreamExt;
use uuid::Uuid;

const ECHO_METHOD: Uuid = Uuid::from_u128(0x5e7a_2c1f_0000_4000_8000_0000_0000_0001);
const COUNTDOWN_METHOD: Uuid = Uuid::from_u128(0x5e7a_2c1f_0000_4000_8000_0000_0000_0002);

// Counts down from the (decimal) number given as arguments, one tick every
// 100ms, giving up as soon as it's cancelled
async fn countdown(invocation: Invocation) -> Result<Payload, MethodError> {
    let text = String::from_utf8_lossy(invocation.arguments().as_bytes()).to_string();
    let mut remaining: u32 = text.trim()
                                 .parse()
                                 .map_err(|_| MethodError::InvalidArguments(text.clone()))?;
    while remaining > 0 {
        tokio::select! {
            _ = invocation.cancellation().cancelled() => return Err(MethodError::Aborted),
            _ = tokio::time::sleep(Duration::from_millis(100)) => remaining -= 1,
        }
    }
    Ok(Payload::from("liftoff"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_builder().filter_level(log::LevelFilter::Info) // Default Log Level
                                          .parse_default_env()
                                          .init();

    let mut methods = MethodTable::new();
    methods.register(ECHO_METHOD, handler_fn(|invocation| async move {
               Ok(invocation.arguments().clone())
           }))?
           .register(COUNTDOWN_METHOD, handler_fn(countdown))?;

    let broker = BrokerConfig::new().set_thread_name("echo-method")
                                    .set_max_in_flight(8)
                                    .build(methods)?;
    let events = broker.events()?;
    tokio::pin!(events);

    let echo = broker.start(StartParameters::new(ECHO_METHOD, "ping"))?;
    let short = broker.start(StartParameters::new(COUNTDOWN_METHOD, "3"))?;
    let long = broker.start(StartParameters::new(COUNTDOWN_METHOD, "100"))?;
    info!("Started {} / {} / {}", echo, short, long);

    // Collect whatever completes, and give up on the long countdown once the
    // other two have been picked up
    let mut outstanding = 2;
    while let Some(event) = events.next().await {
        match event {
            BrokerEvent::MethodCompleted { token, .. } => {
                let completion = broker.end(&token).await?;
                println!("{}: {:?} -> {:?}", token, completion.status, completion.results);
                outstanding -= 1;
                if outstanding == 0 {
                    broker.cancel(&long)?;
                }
            }
            BrokerEvent::MethodCancelled { token, .. } => {
                println!("{}: cancelled", token);
                break;
            }
            _ => {
                warn!("Unknown event");
            }
        }
    }

    println!("{} invocations left in flight", broker.in_flight());
    broker.shutdown();

    Ok(())
}
