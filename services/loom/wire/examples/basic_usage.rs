//! Basic usage example for the loom wire protocol.

use bytes::Bytes;
use loom_wire::{
    read_ack, read_hello, read_message_header, write_ack, write_chunk, write_end_of_message,
    write_hello, write_message_header, BodyReader, Hello, HelloLimits, MessageHeader, Role,
    DEFAULT_MAX_CHUNK, DEFAULT_MAX_KEY,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Loom Wire Protocol Example ===\n");

    // 1. Frame a handshake and one message into a buffer
    println!("1. Encoding handshake + message...");
    let mut wire = Vec::new();
    write_hello(
        &mut wire,
        &Hello {
            role: Role::Producer,
            name: "example".to_string(),
            room: "default".to_string(),
            token: String::new(),
        },
    )
    .await?;

    let body = b"Hello, loom! This body travels as several chunks.";
    write_message_header(
        &mut wire,
        &MessageHeader {
            key: Bytes::from_static(b"greeting"),
            declared_size: body.len() as u64,
            msg_id: 42,
        },
    )
    .await?;
    for chunk in body.chunks(16) {
        write_chunk(&mut wire, chunk).await?;
    }
    write_end_of_message(&mut wire).await?;
    println!("   Encoded {} bytes", wire.len());

    // 2. Decode it again
    println!("\n2. Decoding...");
    let mut reader = &wire[..];
    let hello = read_hello(&mut reader, &HelloLimits::default()).await?;
    println!("   Hello from {:?} {:?} in room {:?}", hello.role, hello.name, hello.room);

    let header = read_message_header(&mut reader, DEFAULT_MAX_KEY).await?;
    println!(
        "   Message {} key={:?} declared_size={}",
        header.msg_id,
        String::from_utf8_lossy(&header.key),
        header.declared_size
    );

    let mut body_reader = BodyReader::new(reader, DEFAULT_MAX_CHUNK);
    let mut out = Vec::new();
    body_reader.read_to_end(&mut out).await?;
    println!("   Body: {}", String::from_utf8_lossy(&out));

    // 3. Ack round trip
    println!("\n3. Ack...");
    let mut ack = Vec::new();
    write_ack(&mut ack, header.msg_id).await?;
    let acked = read_ack(&mut &ack[..]).await?;
    println!("   Acked message {} ({} bytes on the wire)", acked, ack.len());

    println!("\n=== Example completed successfully ===");
    Ok(())
}
