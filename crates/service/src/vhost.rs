use std::sync::Arc;

use parking_lot::RwLock;

use crate::dealer::Dealer;

struct VhostInner {
    name: String,
    dealers: Vec<Dealer>,
}

/// A name-based routing target mapping client host names to dealers.
#[derive(Clone)]
pub struct Vhost(Arc<VhostInner>);

impl Vhost {
    pub(crate) fn new(name: &str, dealers: Vec<Dealer>) -> Self {
        Self(Arc::new(VhostInner {
            name: name.to_string(),
            dealers,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dealers(&self) -> &[Dealer] {
        &self.0.dealers
    }

    /// Pick the available dealer with the smallest load, first encountered
    /// wins on ties.
    pub fn least_loaded(&self) -> Option<Dealer> {
        let mut best: Option<&Dealer> = None;

        for dealer in &self.0.dealers {
            if !dealer.is_available() {
                continue;
            }

            match best {
                Some(it) if dealer.load() >= it.load() => {}
                _ => best = Some(dealer),
            }
        }

        best.cloned()
    }
}

impl PartialEq for Vhost {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Vhost {}

struct AcceptorInner {
    name: String,
    shared: bool,
    vhosts: RwLock<Vec<Vhost>>,
}

/// A bound listening endpoint and the virtual hosts it may serve.
///
/// The vhost list is filled in by the startup fixup; afterwards it is only
/// read.
#[derive(Clone)]
pub struct Acceptor(Arc<AcceptorInner>);

impl Acceptor {
    pub(crate) fn new(name: &str, shared: bool) -> Self {
        Self(Arc::new(AcceptorInner {
            name: name.to_string(),
            shared,
            vhosts: RwLock::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn shared(&self) -> bool {
        self.0.shared
    }

    pub fn vhosts(&self) -> Vec<Vhost> {
        self.0.vhosts.read().clone()
    }

    /// Host lookup is case-insensitive and requires an exact-length match.
    pub fn find_vhost(&self, host: &str) -> Option<Vhost> {
        self.0
            .vhosts
            .read()
            .iter()
            .find(|it| it.name().eq_ignore_ascii_case(host))
            .cloned()
    }

    pub(crate) fn push_vhost(&self, vhost: &Vhost) {
        let mut vhosts = self.0.vhosts.write();

        if !vhosts.contains(vhost) {
            vhosts.push(vhost.clone());
        }
    }
}
