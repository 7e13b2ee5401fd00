use coap_gateway::endpoint::CoapResource;
use coap_gateway::logging;
use coap_gateway::message::{CoapMessage, Code, MediaType, Method, ResponseCode};
use coap_gateway::runtime::{CoapService, GatewayConfig};
use log::{error, info};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match GatewayConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "Main", "Cannot load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => GatewayConfig::default(),
    };

    let service = match CoapService::start(config) {
        Ok(service) => service,
        Err(e) => {
            error!(target: "Main", "Cannot start gateway: {} (code {})", e, e.code());
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!(target: "Main", "Shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    // Simulated sensor, tenths of a degree
    let temperature = Arc::new(AtomicU32::new(215));
    let t = temperature.clone();
    service.add_resource_with_handler(
        CoapResource::new("/sensors/temp")
            .resource_type("temperature-c")
            .interface_description("sensor")
            .content_type(MediaType::TextPlain as u32),
        Arc::new(move |request: &CoapMessage, response: &mut CoapMessage| {
            if request.method() != Some(Method::Get) {
                response.code = Code::Response(ResponseCode::MethodNotAllowed);
                return;
            }
            let value = t.load(Ordering::Relaxed);
            response.set_content_type(MediaType::TextPlain);
            response.payload = format!("{}.{}", value / 10, value % 10).into_bytes();
        }),
    );

    let level = Arc::new(AtomicU32::new(0));
    let l = level.clone();
    service.add_resource_with_handler(
        CoapResource::new("/actuators/light").resource_type("light").interface_description("actuator"),
        Arc::new(move |request: &CoapMessage, response: &mut CoapMessage| match request.method() {
            Some(Method::Get) => response.payload = l.load(Ordering::Relaxed).to_string().into_bytes(),
            Some(Method::Put) => match String::from_utf8_lossy(&request.payload).trim().parse::<u32>() {
                Ok(value) => {
                    l.store(value, Ordering::Relaxed);
                    response.code = Code::Response(ResponseCode::Changed);
                }
                Err(_) => response.code = Code::Response(ResponseCode::BadRequest),
            },
            _ => response.code = Code::Response(ResponseCode::MethodNotAllowed),
        }),
    );

    info!(target: "Main", "Gateway up on {}", service.local_addr());

    let mut ticks = 0u64;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        ticks += 1;
        temperature.store(200 + (ticks % 30) as u32, Ordering::Relaxed);
        if ticks % 30 == 0 {
            for device in service.get_known_devices() {
                info!(target: "Main", "{} offers {} resources", device.address, device.resources.len());
            }
        }
    }

    service.stop();
}
