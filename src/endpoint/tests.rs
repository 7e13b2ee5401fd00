use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::codec::{WireDecode, WireEncode};
use crate::message::{CoapMessage, CoapOption, Code, MessageType, Method, OptionKind, ResponseCode};
use crate::runtime::threadpool::CallbackPool;
use crate::runtime::timer::Scheduler;
use crate::transport::CoapTransport;

struct MockTransport {
    addr: SocketAddr,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl MockTransport {
    fn sent(&self) -> Vec<CoapMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(bytes, _)| CoapMessage::decode(bytes).unwrap())
            .collect()
    }

    fn take(&self) -> Vec<CoapMessage> {
        let msgs = self.sent();
        self.sent.lock().unwrap().clear();
        msgs
    }
}

impl CoapTransport for MockTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().unwrap().push((data.to_vec(), destination));
        Ok(data.len())
    }

    fn receive(&self, _buffer: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        Err(std::io::ErrorKind::WouldBlock.into())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}

fn peer() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn setup(settings: EndpointSettings) -> (Arc<LocalEndpoint>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport {
        addr: "127.0.0.1:5683".parse().unwrap(),
        sent: Mutex::new(Vec::new()),
    });
    let endpoint = LocalEndpoint::new(
        transport.clone(),
        Arc::new(Scheduler::new().unwrap()),
        Arc::new(CallbackPool::new(2).unwrap()),
        settings,
    )
    .unwrap();
    (endpoint, transport)
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn inbound_get(mtype: MessageType, mid: u16, path: &str) -> Vec<u8> {
    let mut req = CoapMessage::request(mtype, Method::Get, mid);
    req.token = vec![0xA0, mid as u8];
    req.set_uri_path(path);
    req.to_bytes().unwrap()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ResponseListener for Recorder {
    fn empty_ack_received(&self, _request: &CoapMessage, _ack: &CoapMessage) {
        self.push("empty_ack".into());
    }

    fn piggybacked_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.push(format!("piggybacked {}", response.code));
    }

    fn separate_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.push(format!("separate {}", response.code));
    }

    fn reset_response_received(&self, _request: &CoapMessage, _reset: &CoapMessage) {
        self.push("reset".into());
    }

    fn maximum_retransmissions_reached(&self, _request: &CoapMessage) {
        self.push("max_retransmissions".into());
    }

    fn service_busy(&self, _request: &CoapMessage) {
        self.push("busy".into());
    }
}

fn outbound_get(endpoint: &LocalEndpoint, mtype: MessageType) -> CoapMessage {
    endpoint
        .create_request(Method::Get, "127.0.0.1", 40000, "/sensors/temp", mtype, None)
        .unwrap()
}

#[test]
fn test_well_known_core_lists_resources() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    endpoint.add_resource(CoapResource::new("/light").resource_type("light"), None);
    endpoint.add_resource(CoapResource::new("temp").observable(true), None);

    endpoint.handle_datagram(&inbound_get(MessageType::Confirmable, 7, "/.well-known/core"), peer());

    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    let response = &sent[0];
    assert_eq!(response.message_type, MessageType::Acknowledgement);
    assert_eq!(response.message_id, 7);
    assert_eq!(response.code, Code::Response(ResponseCode::Content));
    assert_eq!(response.content_type(), Some(40));
    assert_eq!(response.token, vec![0xA0, 7]);
    assert_eq!(
        String::from_utf8(response.payload.clone()).unwrap(),
        "</light>;rt=\"light\",</temp>;obs"
    );
}

#[test]
fn test_well_known_core_rejects_other_methods() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let mut post = CoapMessage::request(MessageType::Confirmable, Method::Post, 9);
    post.set_uri_path(".well-known/core");
    endpoint.handle_datagram(&post.to_bytes().unwrap(), peer());
    assert_eq!(transport.take()[0].code, Code::Response(ResponseCode::MethodNotAllowed));
}

#[test]
fn test_well_known_core_block2() {
    let settings = EndpointSettings { max_szx: 0, ..Default::default() };
    let (endpoint, transport) = setup(settings);
    endpoint.add_resource(CoapResource::new("/a-fairly-long-resource-name"), None);
    let full = "</a-fairly-long-resource-name>";

    endpoint.handle_datagram(&inbound_get(MessageType::Confirmable, 1, "/.well-known/core"), peer());
    let first = transport.take().remove(0);
    assert_eq!(first.block2(), Some(BlockOption::new(0, true, 0)));
    assert_eq!(first.payload, full.as_bytes()[..16].to_vec());

    let mut next = CoapMessage::request(MessageType::Confirmable, Method::Get, 2);
    next.set_uri_path("/.well-known/core");
    next.set_block(OptionKind::Block2, BlockOption::new(1, false, 0));
    endpoint.handle_datagram(&next.to_bytes().unwrap(), peer());
    let second = transport.take().remove(0);
    assert_eq!(second.block2(), Some(BlockOption::new(1, false, 0)));
    assert_eq!(second.payload, full.as_bytes()[16..].to_vec());
}

#[test]
fn test_request_routing_and_error_codes() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let handler: Arc<dyn RequestHandler> = Arc::new(|req: &CoapMessage, resp: &mut CoapMessage| {
        resp.payload = format!("{} ok", req.uri_path()).into_bytes();
    });
    endpoint.add_resource(CoapResource::new("/temp"), Some(handler));
    endpoint.add_resource(CoapResource::new("/silent"), None);

    endpoint.handle_datagram(&inbound_get(MessageType::NonConfirmable, 1, "/temp"), peer());
    endpoint.handle_datagram(&inbound_get(MessageType::Confirmable, 2, "/silent"), peer());
    endpoint.handle_datagram(&inbound_get(MessageType::Confirmable, 3, "/missing"), peer());

    let sent = transport.take();
    assert_eq!(sent[0].message_type, MessageType::NonConfirmable);
    assert_eq!(sent[0].payload, b"/temp ok");
    assert_eq!(sent[1].code, Code::Response(ResponseCode::MethodNotAllowed));
    assert_eq!(sent[2].code, Code::Response(ResponseCode::NotFound));
}

#[test]
fn test_duplicate_request_replays_reply() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: Arc<dyn RequestHandler> = Arc::new(move |_req: &CoapMessage, resp: &mut CoapMessage| {
        counter.fetch_add(1, Ordering::SeqCst);
        resp.payload = b"21.5".to_vec();
    });
    endpoint.add_resource(CoapResource::new("/temp"), Some(handler));

    let datagram = inbound_get(MessageType::Confirmable, 40, "/temp");
    endpoint.handle_datagram(&datagram, peer());
    endpoint.handle_datagram(&datagram, peer());

    let sent = transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ping_and_invalid_confirmable_are_reset() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    endpoint.handle_datagram(&[0x40, 0x00, 0x00, 0x11], peer());
    // Unknown critical option 23 in a CON request
    endpoint.handle_datagram(&[0x40, 0x01, 0x00, 0x12, 0xD1, 23 - 13, 0x00], peer());

    let sent = transport.take();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.message_type == MessageType::Reset && m.is_empty()));
    assert_eq!(sent[0].message_id, 0x11);
    assert_eq!(sent[1].message_id, 0x12);
}

#[test]
fn test_malformed_and_unmatched_messages() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    endpoint.handle_datagram(&[0x40, 0x01, 0x00, 0x01, 0xFF], peer());
    endpoint.handle_datagram(&[0x49, 0x01], peer());

    let mut non = CoapMessage::response(MessageType::NonConfirmable, ResponseCode::Content, 5);
    non.token = vec![9, 9];
    endpoint.handle_datagram(&non.to_bytes().unwrap(), peer());
    assert!(transport.take().is_empty());

    let mut con = CoapMessage::response(MessageType::Confirmable, ResponseCode::Content, 6);
    con.token = vec![9, 9];
    endpoint.handle_datagram(&con.to_bytes().unwrap(), peer());
    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Reset);
}

#[test]
fn test_piggybacked_response_delivered_once() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let recorder = Arc::new(Recorder::default());
    let request = outbound_get(&endpoint, MessageType::Confirmable);
    endpoint.send_request(request.clone(), Some(recorder.clone())).unwrap();

    let sent = transport.take();
    assert_eq!(sent[0].uri_path(), "/sensors/temp");
    assert_eq!(sent[0].get_uri_from_request().unwrap().port, 40000);

    let mut ack = CoapMessage::response_to(&request, ResponseCode::Content, 0);
    ack.payload = b"22".to_vec();
    endpoint.handle_datagram(&ack.to_bytes().unwrap(), peer());
    endpoint.handle_datagram(&ack.to_bytes().unwrap(), peer());

    assert!(wait_until(|| !recorder.events().is_empty()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.events(), vec!["piggybacked 2.05 Content"]);
    assert_eq!(endpoint.pending_transactions(), 0);
}

#[test]
fn test_empty_ack_then_separate_response() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let recorder = Arc::new(Recorder::default());
    let request = outbound_get(&endpoint, MessageType::Confirmable);
    endpoint.send_request(request.clone(), Some(recorder.clone())).unwrap();
    transport.take();

    endpoint.handle_datagram(&CoapMessage::empty_ack(&request).to_bytes().unwrap(), peer());

    let mut separate = CoapMessage::response(MessageType::Confirmable, ResponseCode::Content, 0x7000);
    separate.token = request.token.clone();
    endpoint.handle_datagram(&separate.to_bytes().unwrap(), peer());
    endpoint.handle_datagram(&separate.to_bytes().unwrap(), peer());

    assert!(wait_until(|| recorder.events().len() >= 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.events(), vec!["empty_ack", "separate 2.05 Content"]);

    // Both copies of the separate response are acknowledged
    let acks = transport.take();
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|m| m.message_type == MessageType::Acknowledgement && m.message_id == 0x7000));
}

#[test]
fn test_reset_response() {
    let (endpoint, _transport) = setup(EndpointSettings::default());
    let recorder = Arc::new(Recorder::default());
    let request = outbound_get(&endpoint, MessageType::Confirmable);
    endpoint.send_request(request.clone(), Some(recorder.clone())).unwrap();

    endpoint.handle_datagram(&CoapMessage::reset(&request).to_bytes().unwrap(), peer());
    assert!(wait_until(|| recorder.events() == vec!["reset"]));
    assert_eq!(endpoint.pending_transactions(), 0);
}

#[test]
fn test_retransmission_until_exhausted() {
    let settings = EndpointSettings {
        ack_timeout: Duration::from_millis(20),
        max_retransmit: 2,
        ..Default::default()
    };
    let (endpoint, transport) = setup(settings);
    let recorder = Arc::new(Recorder::default());
    let request = outbound_get(&endpoint, MessageType::Confirmable);
    endpoint.send_request(request.clone(), Some(recorder.clone())).unwrap();

    assert!(wait_until(|| recorder.events() == vec!["max_retransmissions"]));
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| m.message_id == request.message_id));
    assert_eq!(endpoint.pending_transactions(), 0);
}

#[test]
fn test_non_confirmable_is_not_retransmitted() {
    let settings = EndpointSettings { ack_timeout: Duration::from_millis(10), ..Default::default() };
    let (endpoint, transport) = setup(settings);
    endpoint
        .send_request(outbound_get(&endpoint, MessageType::NonConfirmable), None)
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.sent().len(), 1);
}

#[test]
fn test_service_busy_when_serializing() {
    let settings = EndpointSettings { serialize_requests: true, ..Default::default() };
    let (endpoint, transport) = setup(settings);
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());

    endpoint.send_request(outbound_get(&endpoint, MessageType::Confirmable), Some(first.clone())).unwrap();
    endpoint.send_request(outbound_get(&endpoint, MessageType::Confirmable), Some(second.clone())).unwrap();

    assert!(wait_until(|| second.events() == vec!["busy"]));
    assert!(first.events().is_empty());
    assert_eq!(transport.sent().len(), 1);
}

#[test]
fn test_repeated_group_requests_not_busy() {
    let settings = EndpointSettings { serialize_requests: true, ..Default::default() };
    let (endpoint, transport) = setup(settings);
    let listener = Arc::new(Recorder::default());

    for _ in 0..2 {
        let mut request = CoapMessage::request(MessageType::NonConfirmable, Method::Get, endpoint.next_message_id());
        request.peer_address = Some("224.0.1.187:5683".parse().unwrap());
        request.set_uri_path(WELL_KNOWN_CORE);
        endpoint.send_group_request(request, Some(listener.clone())).unwrap();
    }

    assert_eq!(transport.sent().len(), 2);
    assert_eq!(endpoint.pending_transactions(), 2);
    thread::sleep(Duration::from_millis(50));
    assert!(listener.events().is_empty());
}

#[test]
fn test_own_group_request_not_answered() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    endpoint.add_resource(CoapResource::new("/light"), None);

    let mut request = CoapMessage::request(MessageType::NonConfirmable, Method::Get, endpoint.next_message_id());
    request.peer_address = Some("224.0.1.187:5683".parse().unwrap());
    request.set_uri_path(WELL_KNOWN_CORE);
    endpoint.send_group_request(request, None).unwrap();
    let sent = transport.take();
    assert_eq!(sent.len(), 1);

    // Looped back from the interface address, same port as ours
    let own_interface: SocketAddr = "192.168.1.10:5683".parse().unwrap();
    endpoint.handle_group_datagram(&sent[0].to_bytes().unwrap(), own_interface);
    assert!(transport.take().is_empty());

    // Another gateway on the same port with its own token is answered
    let mut foreign = CoapMessage::request(MessageType::NonConfirmable, Method::Get, sent[0].message_id);
    foreign.token = vec![0xEE];
    foreign.set_uri_path(WELL_KNOWN_CORE);
    endpoint.handle_group_datagram(&foreign.to_bytes().unwrap(), "192.168.1.20:5683".parse().unwrap());
    let replies = transport.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].response_code(), Some(ResponseCode::Content));
}

#[test]
fn test_send_request_validation() {
    let (endpoint, _transport) = setup(EndpointSettings::default());
    let response = CoapMessage::response(MessageType::NonConfirmable, ResponseCode::Content, 1);
    assert!(matches!(endpoint.send_request(response, None), Err(CoapError::NotARequest)));

    let orphan = CoapMessage::request(MessageType::NonConfirmable, Method::Get, 1);
    assert!(matches!(endpoint.send_request(orphan, None), Err(CoapError::MissingPeer)));

    let err = endpoint
        .create_request(Method::Get, "no-such-host.invalid", 5683, "/x", MessageType::Confirmable, None)
        .unwrap_err();
    assert_eq!(err.code(), 162);
}

#[test]
fn test_confirmable_response_retransmitted_until_acked() {
    let settings = EndpointSettings { ack_timeout: Duration::from_millis(20), ..Default::default() };
    let (endpoint, transport) = setup(settings);
    let mut response = CoapMessage::response(MessageType::Confirmable, ResponseCode::Content, 300);
    response.token = vec![1];
    response.peer_address = Some(peer());
    endpoint.send_response(response.clone()).unwrap();

    assert!(wait_until(|| transport.sent().len() >= 2));
    endpoint.handle_datagram(&CoapMessage::empty_ack(&response).to_bytes().unwrap(), peer());
    assert_eq!(endpoint.pending_transactions(), 0);
    let count = transport.sent().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.sent().len(), count);
}

struct Collecting {
    notifications: Mutex<Vec<Vec<u8>>>,
    failures: Mutex<Vec<ObservationFailure>>,
}

impl Collecting {
    fn new() -> Arc<Self> {
        Arc::new(Collecting { notifications: Mutex::new(Vec::new()), failures: Mutex::new(Vec::new()) })
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.notifications.lock().unwrap().clone()
    }
}

impl Observer for Collecting {
    fn notification_received(&self, _resource: &CoapResource, notification: &CoapMessage) {
        self.notifications.lock().unwrap().push(notification.payload.clone());
    }

    fn observation_failed(&self, _resource: &CoapResource, reason: ObservationFailure) {
        self.failures.lock().unwrap().push(reason);
    }
}

#[test]
fn test_observation_lifecycle() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let first = Collecting::new();
    let second = Collecting::new();
    let first_dyn: Arc<dyn Observer> = first.clone();
    let second_dyn: Arc<dyn Observer> = second.clone();

    let resource = endpoint
        .create_observation_relationship("127.0.0.1", 40000, "sensors/temp", first_dyn.clone())
        .unwrap();
    assert_eq!(resource.uri, "/sensors/temp");
    assert_eq!(resource.origin, Some(peer()));

    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    let subscribe = &sent[0];
    assert_eq!(subscribe.method(), Some(Method::Get));
    assert!(subscribe.has_option(OptionKind::Observe));

    // A second observer joins without a new GET
    endpoint
        .create_observation_relationship("127.0.0.1", 40000, "/sensors/temp", second_dyn.clone())
        .unwrap();
    assert!(transport.take().is_empty());
    assert_eq!(endpoint.remote(peer()).observer_count("/sensors/temp"), 2);

    let mut ack = CoapMessage::response_to(subscribe, ResponseCode::Content, 0);
    ack.add_option(CoapOption::uint(OptionKind::Observe, 1));
    ack.payload = b"20".to_vec();
    endpoint.handle_datagram(&ack.to_bytes().unwrap(), peer());

    let mut notification = CoapMessage::response(MessageType::Confirmable, ResponseCode::Content, 0x4000);
    notification.token = subscribe.token.clone();
    notification.add_option(CoapOption::uint(OptionKind::Observe, 2));
    notification.payload = b"21".to_vec();
    endpoint.handle_datagram(&notification.to_bytes().unwrap(), peer());

    assert!(wait_until(|| first.payloads().len() == 2 && second.payloads().len() == 2));
    assert_eq!(first.payloads(), vec![b"20".to_vec(), b"21".to_vec()]);
    let acks = transport.take();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].message_type, MessageType::Acknowledgement);

    assert!(!endpoint.terminate_observation_relationship(&resource, &first_dyn));
    assert!(endpoint.terminate_observation_relationship(&resource, &second_dyn));
    assert!(!endpoint.terminate_observation_relationship(&resource, &second_dyn));

    // The peer is told to stop with a reset
    notification.message_id = 0x4001;
    endpoint.handle_datagram(&notification.to_bytes().unwrap(), peer());
    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Reset);
}

#[test]
fn test_observation_error_response_fails_relationship() {
    let (endpoint, transport) = setup(EndpointSettings::default());
    let observer = Collecting::new();
    endpoint
        .create_observation_relationship("127.0.0.1", 40000, "/missing", observer.clone())
        .unwrap();
    let subscribe = transport.take().remove(0);

    let ack = CoapMessage::response_to(&subscribe, ResponseCode::NotFound, 0);
    endpoint.handle_datagram(&ack.to_bytes().unwrap(), peer());

    assert!(wait_until(|| !observer.failures.lock().unwrap().is_empty()));
    assert_eq!(
        *observer.failures.lock().unwrap(),
        vec![ObservationFailure::ErrorResponse(ResponseCode::NotFound)]
    );
    assert_eq!(endpoint.remote(peer()).observer_count("/missing"), 0);
    assert!(observer.payloads().is_empty());
}

#[test]
fn test_terminate_unknown_relationship() {
    let (endpoint, _transport) = setup(EndpointSettings::default());
    let observer: Arc<dyn Observer> = Collecting::new();
    assert!(!endpoint.terminate_observation_relationship(&CoapResource::new("/x"), &observer));
    let remote = CoapResource::with_origin("/x", peer());
    assert!(!endpoint.terminate_observation_relationship(&remote, &observer));
}

#[test]
fn test_max_szx_clamped() {
    let settings = EndpointSettings { max_szx: 9, ..Default::default() };
    let (endpoint, _transport) = setup(settings);
    assert_eq!(endpoint.max_szx(), 6);
    assert_eq!(endpoint.block_option(3, true, 7).szx, 6);

    let settings = EndpointSettings { max_szx: 2, ..Default::default() };
    let (endpoint, _transport) = setup(settings);
    assert_eq!(endpoint.block_option(0, false, 6).szx, 2);
}

#[test]
fn test_shutdown_clears_state() {
    let (endpoint, _transport) = setup(EndpointSettings::default());
    endpoint.add_resource(CoapResource::new("/light"), None);
    endpoint.send_request(outbound_get(&endpoint, MessageType::Confirmable), None).unwrap();
    endpoint.remote(peer());

    endpoint.shutdown();
    assert_eq!(endpoint.pending_transactions(), 0);
    assert!(endpoint.remotes().is_empty());
    assert!(endpoint.resources().is_empty());
}
