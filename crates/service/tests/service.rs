use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gateway_server_service::{
    AcceptorConfig, Service, ServiceHandler, ServiceOptions, VhostConfig, dealer::Dealer,
};

#[derive(Default, Clone)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().unwrap())
    }
}

impl ServiceHandler for Events {
    fn on_end(&self, dealer: &Dealer, id: codec::SessionId) {
        self.0.lock().unwrap().push(format!("end {} {id}", dealer.name()));
    }

    fn on_dealer_off(&self, dealer: &Dealer) {
        self.0.lock().unwrap().push(format!("off {}", dealer.name()));
    }

    fn on_dealer_available(&self, dealer: &Dealer) {
        self.0.lock().unwrap().push(format!("available {}", dealer.name()));
    }
}

fn make_service(vhosts: Vec<VhostConfig>) -> (Arc<Service<Events>>, Events) {
    let events = Events::default();

    let service = Service::new(ServiceOptions {
        sht_size: 16,
        // wide intervals keep the background second-tick from interfering
        // with tests that drive the timer by hand
        ping_freq: 10,
        session_timeout: 120,
        acceptors: vec![AcceptorConfig {
            name: "main".to_string(),
            shared: true,
        }],
        vhosts,
        handler: events.clone(),
    });

    service.fixup();
    (service, events)
}

fn vhost(name: &str, dealers: &[&str]) -> VhostConfig {
    VhostConfig {
        name: name.to_string(),
        dealers: dealers.iter().map(|it| it.to_string()).collect(),
        acceptors: vec![],
    }
}

#[test]
fn one_end_frame_per_routed_session() {
    let (service, events) = make_service(vec![vhost("a.example", &["worker-1"])]);
    let acceptor = service.acceptor("main").unwrap();

    let session = service.open_session(1);
    let id = session.id();
    let dealer = service.assign_dealer(&session, &acceptor, "a.example").unwrap();

    assert_eq!(dealer.load(), 1);
    assert_eq!(service.active_sessions(), 1);

    service.close_session(id);
    service.close_session(id);

    assert_eq!(dealer.load(), 0);
    assert_eq!(service.active_sessions(), 0);
    assert!(service.get(id).is_none());
    assert_eq!(events.take(), vec![format!("end worker-1 {id}")]);
}

#[test]
fn least_loaded_available_dealer_wins() {
    let (service, _) = make_service(vec![
        vhost("bulk1.example", &["d1"]),
        vhost("bulk2.example", &["d2"]),
        vhost("mixed.example", &["d1", "d2", "d3"]),
    ]);
    let acceptor = service.acceptor("main").unwrap();

    // d1 carries two sessions, d2 one, d3 is off
    for _ in 0..2 {
        let session = service.open_session(1);
        service.assign_dealer(&session, &acceptor, "bulk1.example").unwrap();
    }

    let session = service.open_session(1);
    service.assign_dealer(&session, &acceptor, "bulk2.example").unwrap();

    service.dealer(b"d3").unwrap().set_available(false);

    let session = service.open_session(1);
    let chosen = service
        .assign_dealer(&session, &acceptor, "MIXED.example")
        .unwrap();

    assert_eq!(chosen.name(), "d2");
    assert_eq!(chosen.load(), 2);
}

#[test]
fn ties_go_to_the_first_dealer() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1", "d2"])]);
    let acceptor = service.acceptor("main").unwrap();

    let session = service.open_session(1);
    let chosen = service.assign_dealer(&session, &acceptor, "a.example").unwrap();

    assert_eq!(chosen.name(), "d1");
}

#[test]
fn unknown_host_and_empty_pool_fail_assignment() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1"])]);
    let acceptor = service.acceptor("main").unwrap();

    let session = service.open_session(1);
    assert!(service.assign_dealer(&session, &acceptor, "b.example").is_none());

    service.dealer(b"d1").unwrap().set_available(false);
    assert!(service.assign_dealer(&session, &acceptor, "a.example").is_none());
    assert_eq!(service.dealer(b"d1").unwrap().load(), 0);
}

#[test]
fn connection_close_detaches_persistent_sessions() {
    let (service, events) = make_service(vec![vhost("a.example", &["d1"])]);
    let acceptor = service.acceptor("main").unwrap();
    let dealer = service.dealer(b"d1").unwrap();

    // s1: routed, s2: routed + persistent, s3: never routed
    let s1 = service.open_session(7);
    service.assign_dealer(&s1, &acceptor, "a.example").unwrap();

    let s2 = service.open_session(7);
    service.assign_dealer(&s2, &acceptor, "a.example").unwrap();
    s2.lock().persistent = true;

    let s3 = service.open_session(7);

    assert_eq!(dealer.load(), 2);
    assert_eq!(service.active_sessions(), 3);

    service.close_connection(7);

    // only s1 emitted an end; s2 survives detached
    assert_eq!(dealer.load(), 1);
    assert_eq!(events.take(), vec![format!("end d1 {}", s1.id())]);
    assert!(service.get(s1.id()).is_none());
    assert!(service.get(s3.id()).is_none());

    let survivor = service.get(s2.id()).unwrap();
    assert!(survivor.lock().connection.is_none());
    assert_eq!(service.active_sessions(), 1);
}

#[test]
fn stealth_sessions_never_emit_an_end() {
    let (service, events) = make_service(vec![vhost("a.example", &["d1"])]);
    let dealer = service.dealer(b"d1").unwrap();

    let session = service.open_session(1);
    {
        let mut inner = session.lock();
        inner.stealth = true;
        // stealth sessions reference their dealer without entering the
        // load accounting
        inner.dealer = Some(dealer.clone());
    }

    service.close_session(session.id());

    assert_eq!(dealer.load(), 0);
    assert!(events.take().is_empty());
}

#[test]
fn fixup_is_idempotent() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1"])]);
    let acceptor = service.acceptor("main").unwrap();

    assert_eq!(acceptor.vhosts().len(), 1);

    service.fixup();
    service.fixup();

    let vhosts = acceptor.vhosts();
    assert_eq!(vhosts.len(), 1);
    assert_eq!(vhosts[0].name(), "a.example");
}

#[test]
fn explicit_bindings_beat_shared_acceptors() {
    let events = Events::default();
    let service = Service::new(ServiceOptions {
        sht_size: 16,
        ping_freq: 1,
        session_timeout: 120,
        acceptors: vec![
            AcceptorConfig {
                name: "public".to_string(),
                shared: true,
            },
            AcceptorConfig {
                name: "internal".to_string(),
                shared: false,
            },
        ],
        vhosts: vec![
            VhostConfig {
                name: "pinned.example".to_string(),
                dealers: vec!["d1".to_string()],
                acceptors: vec!["internal".to_string()],
            },
            VhostConfig {
                name: "floating.example".to_string(),
                dealers: vec!["d1".to_string()],
                acceptors: vec![],
            },
        ],
        handler: events,
    });

    service.fixup();
    service.fixup();

    let public = service.acceptor("public").unwrap();
    let internal = service.acceptor("internal").unwrap();

    // the pinned vhost only appears on its own acceptor, the floating one
    // only on the shared acceptor
    assert_eq!(public.vhosts().len(), 1);
    assert_eq!(public.vhosts()[0].name(), "floating.example");
    assert_eq!(internal.vhosts().len(), 1);
    assert_eq!(internal.vhosts()[0].name(), "pinned.example");

    assert!(public.find_vhost("FLOATING.example").is_some());
    assert!(public.find_vhost("floating.example.org").is_none());
}

#[test]
fn silent_dealers_are_probed_then_demoted() {
    let (service, events) = make_service(vec![vhost("a.example", &["d1"])]);
    let dealer = service.dealer(b"d1").unwrap();

    // fresh dealer: within one interval, nothing to do
    assert!(service.ping_sweep().is_empty());

    // past one interval: probed but still available
    for _ in 0..15 {
        service.timer().add();
    }
    assert_eq!(service.ping_sweep(), vec![dealer.identity().clone()]);
    assert!(dealer.is_available());

    // past three intervals: demoted, still probed
    for _ in 0..20 {
        service.timer().add();
    }
    assert_eq!(service.ping_sweep(), vec![dealer.identity().clone()]);
    assert!(!dealer.is_available());
    assert_eq!(events.take(), vec!["off d1".to_string()]);

    // inbound traffic revives it
    service.touch_dealer(b"d1").unwrap();
    assert!(dealer.is_available());
    assert_eq!(events.take(), vec!["available d1".to_string()]);
    assert!(service.ping_sweep().is_empty());
}

#[test]
fn groups_are_left_on_close() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1"])]);

    let s1 = service.open_session(1);
    let s2 = service.open_session(1);

    service.join_group("room", s1.id());
    service.join_group("room", s1.id());
    service.join_group("room", s2.id());

    assert_eq!(service.group_members("room"), vec![s1.id(), s2.id()]);

    service.close_session(s1.id());
    assert_eq!(service.group_members("room"), vec![s2.id()]);

    service.leave_group("room", s2.id());
    assert!(service.group_members("room").is_empty());
    assert!(s2.lock().groups.is_empty());
}

#[test]
fn reattachment_moves_the_session_between_connections() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1"])]);

    let session = service.open_session(1);
    session.lock().persistent = true;
    let id = session.id();

    service.close_connection(1);
    assert!(service.get(id).unwrap().lock().connection.is_none());

    service.attach_session(id, 2).unwrap();
    assert_eq!(service.get(id).unwrap().lock().connection, Some(2));

    // closing the old connection again must not touch it
    service.close_connection(1);
    assert!(service.get(id).is_some());

    service.close_connection(2);
    let survivor = service.get(id).unwrap();
    assert!(survivor.lock().connection.is_none());
}

#[test]
fn push_queue_drains_one_message_per_tick() {
    let (service, _) = make_service(vec![vhost("a.example", &["d1"])]);

    let session = service.open_session(1);
    session.lock().persistent = true;
    let id = session.id();

    assert_eq!(service.queue_push(id, Bytes::from_static(b"first")), Some(true));
    assert_eq!(service.queue_push(id, Bytes::from_static(b"second")), Some(true));

    // only one timer may be pending at a time
    assert!(service.arm_timer(id));
    assert!(!service.arm_timer(id));

    let poll = service.poll_push(id).unwrap();
    assert_eq!(poll.message.as_deref(), Some(b"first".as_slice()));
    assert_eq!(poll.connection, Some(1));

    // the expiry released the latch
    assert!(service.arm_timer(id));

    let poll = service.poll_push(id).unwrap();
    assert_eq!(poll.message.as_deref(), Some(b"second".as_slice()));

    // an empty queue delivers the heartbeat
    let poll = service.poll_push(id).unwrap();
    assert!(poll.message.is_none());
}

#[test]
fn idle_persistent_sessions_are_evicted_with_accounting() {
    let events = Events::default();
    let service = Service::new(ServiceOptions {
        sht_size: 16,
        ping_freq: 60,
        session_timeout: 1,
        acceptors: vec![AcceptorConfig {
            name: "main".to_string(),
            shared: true,
        }],
        vhosts: vec![vhost("a.example", &["d1"])],
        handler: events.clone(),
    });

    service.fixup();
    let acceptor = service.acceptor("main").unwrap();
    let dealer = service.dealer(b"d1").unwrap();

    let session = service.open_session(1);
    let id = session.id();
    service.assign_dealer(&session, &acceptor, "a.example").unwrap();
    session.lock().persistent = true;

    service.close_connection(1);
    assert!(service.get(id).is_some());
    assert_eq!(dealer.load(), 1);

    // the background tick advances once per second; give the deadline a
    // couple of beats to pass
    std::thread::sleep(std::time::Duration::from_secs(3));

    assert!(service.get(id).is_none());
    assert_eq!(dealer.load(), 0);
    assert_eq!(events.take(), vec![format!("end d1 {id}")]);
}
