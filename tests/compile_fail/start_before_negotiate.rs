// Streaming cannot start before a format is negotiated and buffers are mapped.
use framegrab::{Session, StubBackend, StubConfig};

fn main() {
    let session = Session::open_with(StubBackend::new(StubConfig::default()), "stub://cam").unwrap();
    let _ = session.start_streaming();
}
