// A frame must be released before the next wait can lend out another one.
use std::time::Duration;

use framegrab::{FormatRequest, Session, StubBackend, StubConfig};

fn main() {
    let session = Session::open_with(StubBackend::new(StubConfig::default()), "stub://cam").unwrap();
    let mut session = session.negotiate(&FormatRequest::default()).unwrap().allocate_buffers(2).unwrap();
    session.enqueue_all().unwrap();
    let mut session = session.start_streaming().unwrap();
    let first = session.wait_for_frame(Duration::from_secs(1)).unwrap();
    let second = session.wait_for_frame(Duration::from_secs(1)).unwrap();
    first.release().unwrap();
    second.release().unwrap();
}
