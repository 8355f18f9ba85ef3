use std::error::Error;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tracing::{debug, error};

use stairled_engine::sensor::SensorSample;

use crate::settings::Gateway;

/// Subscribes to the sensor topic and forwards parsed readings into the
/// bounded sample channel. The poll loop runs on its own task; connection
/// errors back off and retry forever.
pub async fn start_mqtt_client(
    settings: Gateway,
    tx: broadcast::Sender<SensorSample>,
) -> Result<(), Box<dyn Error>> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(5));

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client.subscribe(&settings.topic, QoS::AtMostOnce).await?;
    debug!("subscribed to {}", settings.topic);

    tokio::spawn(async move {
        // the client must outlive the poll loop or the connection drops
        let _client = client;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match serde_json::from_slice::<SensorSample>(&publish.payload) {
                        Ok(sample) => {
                            debug!("sensor sample {:?}", sample);
                            // send only fails with no receivers; samples are
                            // disposable then
                            let _ = tx.send(sample);
                        }
                        Err(err) => debug!("unparseable sensor payload: {err}"),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!("MQTT error: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok(())
}
