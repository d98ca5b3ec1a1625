mod data_streams;
mod handshake;
mod harness;
mod objects_sync;
mod send_token;
