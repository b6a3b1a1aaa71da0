//! The no-I/O resolver for `Target::Literal` targets: delivers the single
//! address once and never re-resolves, since there is nothing to look up.

use super::{Address, Listener, ResolutionResult, Resolver};
use crate::target::Target;
use std::sync::Arc;

pub struct StaticResolver {
    address: Address,
}

impl StaticResolver {
    pub fn new(target: &Target) -> Option<Self> {
        match target {
            Target::Literal { ip, port } => Some(Self {
                address: Address::new(*ip, *port),
            }),
            Target::Dns { .. } => None,
        }
    }
}

impl Resolver for StaticResolver {
    fn start(&self, listener: Arc<dyn Listener>) {
        listener.on_result(ResolutionResult {
            addresses: vec![self.address.clone()],
            service_config: None,
            service_config_error: None,
        });
    }

    fn refresh(&self) {
        // Nothing to refresh: a literal address cannot become stale.
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolutionResult;
    use std::sync::Mutex;

    struct Capture(Mutex<Option<ResolutionResult>>);

    impl Listener for Capture {
        fn on_result(&self, result: ResolutionResult) {
            *self.0.lock().unwrap() = Some(result);
        }
        fn on_error(&self, _status: crate::status::Status) {}
    }

    #[test]
    fn delivers_single_literal_address() {
        let target = Target::parse("10.0.0.5:443").unwrap();
        let resolver = StaticResolver::new(&target).unwrap();
        let capture = Arc::new(Capture(Mutex::new(None)));
        resolver.start(capture.clone());
        let result = capture.0.lock().unwrap().take().unwrap();
        assert_eq!(result.addresses.len(), 1);
        assert_eq!(result.addresses[0].port, 443);
    }
}
