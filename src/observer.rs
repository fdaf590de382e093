use bytes::Bytes;
use codec::{Command, SessionId};
use service::{ServiceHandler, dealer::Dealer};

use crate::bus::BusSender;

/// Connects the orchestration core's events to the outside world: `end`
/// frames go onto the bus, lifecycle transitions go to the log.
#[derive(Clone)]
pub struct Observer {
    bus: BusSender,
}

impl Observer {
    pub fn new(bus: BusSender) -> Self {
        Self { bus }
    }
}

impl ServiceHandler for Observer {
    /// The session is definitively closing; this is the single `end` frame
    /// its dealer receives.
    fn on_end(&self, dealer: &Dealer, id: SessionId) {
        log::trace!("session end: id={id}, dealer={:?}", dealer.name());

        self.bus
            .send(dealer.identity().clone(), Some(id), Command::End, Bytes::new());
    }

    fn on_session_open(&self, id: SessionId) {
        log::trace!("session open: id={id}");
    }

    fn on_session_close(&self, id: SessionId) {
        log::trace!("session close: id={id}");
    }

    fn on_dealer_off(&self, dealer: &Dealer) {
        log::warn!("dealer \"{}\" is OFF", dealer.name());
    }

    fn on_dealer_available(&self, dealer: &Dealer) {
        log::info!("dealer \"{}\" is available", dealer.name());
    }
}
