//! Print deterministic wire vectors for clients written against the protocol.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::{FrameCodec, Node, RealUser, RequestHeaders};

fn main() {
    let codec = FrameCodec::default();

    // Vector 1: real user frame for "alice"
    let user = RealUser::from_username("alice");
    print_test_vector("real_user_alice", &codec.encode(user.as_bytes()).expect("encode"));

    // Vector 2: packed headers of a minimal request
    let request = RequestHeaders::new("/echo", "ping");
    print_test_vector("headers_ping", &packed(&request));

    // Vector 3: packed headers of a forced request pinned to a node
    let mut forced = RequestHeaders::new("/files", "list");
    forced.params_mut().insert("dir", "/tmp".into());
    forced.set_force(true);
    forced.set_node(Some(Node::new("10.0.0.2", 17000).expect("valid node")));
    print_test_vector("headers_forced", &packed(&forced));

    // Vector 4: empty frame
    print_test_vector("empty_frame", &codec.encode(&[]).expect("encode"));
}

fn packed(request: &RequestHeaders) -> Vec<u8> {
    rmp_serde::to_vec(&request.to_headers().to_value()).expect("serialization failed")
}

fn print_test_vector(name: &str, bytes: &[u8]) {
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
