use std::time::Duration;

use log::{error, info, warn};
use power2mqtt::mqtt::internal_commands::CommandHandler;
use power2mqtt::mqtt::{get_mqtt_health_status, publish_uptime, MqttConnectionStatus, MqttManager};
use power2mqtt::transport::check_protocol;
use power2mqtt::{load_definition, Config, Driver, DriverOptions, DriverRequest, Transport};

fn exit_with(message: String) -> ! {
    error!("{message}");
    std::process::exit(1);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("P2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    /* -k runs the shutdown sequence once and exits */
    let kill_power = std::env::args().skip(1).any(|a| a == "-k");

    let config = Config::load().unwrap_or_else(|e| exit_with(e.to_string()));
    let definition = load_definition(&config.driver.definition).unwrap_or_else(|e| exit_with(e.to_string()));
    check_protocol(&config.driver.transport, definition.protocol).unwrap_or_else(|e| exit_with(e.to_string()));
    let transport = Transport::from_config(&config.driver.transport, Duration::from_secs(config.driver.timeout))
        .unwrap_or_else(|e| exit_with(e.to_string()));

    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    let name = config.driver.name.clone();
    let mut driver = Driver::new(definition, transport, DriverOptions::from_config(&config.driver))
        .with_publisher(tx.clone());

    if let Err(e) = driver.start().await {
        exit_with(format!("Driver {name} failed to start: {e}"));
    }

    if kill_power {
        info!("Killing power of {name}");
        let result = driver.shutdown().await;
        /* let the last state reach the broker */
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = result {
            exit_with(format!("Shutdown of {name} failed: {e}"));
        }
        return;
    }

    let (requests, receiver) = tokio::sync::mpsc::channel(10);

    let command = CommandHandler::new(tx.clone(), requests.clone(), &name);
    tokio::spawn(async move {
        command.start_thread().await;
    });

    let stop = requests.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Signal received, stopping");
            let _ = stop.send(DriverRequest::Stop).await;
        }
    });

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    let uptime_name = name.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let health = get_mqtt_health_status().await;
            if !matches!(health.status, MqttConnectionStatus::Connected) {
                warn!("MQTT broker not connected ({:?}), {} connections so far", health.status, health.connection_attempts);
            }
            publish_uptime(&uptime_sender, &uptime_name).await;
        }
    });

    info!("All modules started, driver {name} is running");
    if let Err(e) = driver.run(receiver).await {
        exit_with(format!("Driver {name} terminated: {e}"));
    }
    info!("Driver {name} stopped");
}
