use coap_gateway::logging;
use coap_gateway::runtime::{CoapService, GatewayConfig};
use log::LevelFilter;
use std::thread;
use std::time::Duration;

/// Usage: coap_discover [address[:port]] [wait-seconds]
fn main() {
    logging::init_with_level(LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let mut config = GatewayConfig::default();
    config.bind_port = 0;
    config.discovery.interval_secs = 0;
    if let Some(target) = args.next() {
        match target.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                config.discovery.address = host.to_string();
                config.discovery.port = port.parse().unwrap_or(5683);
            }
            _ => config.discovery.address = target,
        }
    }
    let wait = args.next().and_then(|s| s.parse().ok()).unwrap_or(3);

    let service = match CoapService::start(config) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Cannot start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = service.discover_now() {
        eprintln!("Discovery request failed: {}", e);
        std::process::exit(1);
    }
    thread::sleep(Duration::from_secs(wait));

    let devices = service.get_known_devices();
    if devices.is_empty() {
        println!("No devices answered");
    }
    for device in devices {
        println!("{}", device.address);
        for resource in device.resources {
            let rt = resource.resource_type.as_deref().unwrap_or("-");
            let obs = if resource.observable { " (observable)" } else { "" };
            println!("  {} rt={}{}", resource.uri, rt, obs);
        }
    }
    service.stop();
}
