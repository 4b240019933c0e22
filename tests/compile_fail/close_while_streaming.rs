// A streaming session has to be stopped before the device can be closed.
use framegrab::{FormatRequest, Session, StubBackend, StubConfig};

fn main() {
    let session = Session::open_with(StubBackend::new(StubConfig::default()), "stub://cam").unwrap();
    let mut session = session.negotiate(&FormatRequest::default()).unwrap().allocate_buffers(2).unwrap();
    session.enqueue_all().unwrap();
    let streaming = session.start_streaming().unwrap();
    let _ = streaming.close();
}
