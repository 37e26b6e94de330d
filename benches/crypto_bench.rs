//! Cipher benchmarks.
//!
//! Per-chunk seal/open cost, TCP session throughput per method, UDP packet
//! cost, and the two key derivations.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ss_local::crypto::{evp_bytes_to_key, session_subkey, Aead, CipherContext, Hkdf, Method, Nonce};

fn bench_chunk_seal(c: &mut Criterion) {
    let aead = Aead::new(Method::ChaCha20IetfPoly1305, &[0x42u8; 32]).unwrap();
    let nonce = Nonce::zero();
    let plaintext = vec![0u8; 0x3FFF];
    let mut out = BytesMut::with_capacity(0x3FFF + 16);

    let mut group = c.benchmark_group("chunk_seal");
    group.throughput(Throughput::Bytes(0x3FFF));

    group.bench_function("max_chunk", |b| {
        b.iter(|| {
            out.clear();
            aead.seal(&nonce, &plaintext, &mut out).unwrap();
            black_box(out.len())
        })
    });

    group.finish();
}

fn bench_chunk_open(c: &mut Criterion) {
    let aead = Aead::new(Method::ChaCha20IetfPoly1305, &[0x42u8; 32]).unwrap();
    let nonce = Nonce::zero();
    let mut sealed = BytesMut::new();
    aead.seal(&nonce, &vec![0u8; 0x3FFF], &mut sealed).unwrap();
    let mut out = BytesMut::with_capacity(0x3FFF);

    let mut group = c.benchmark_group("chunk_open");
    group.throughput(Throughput::Bytes(0x3FFF));

    group.bench_function("max_chunk", |b| {
        b.iter(|| {
            out.clear();
            aead.open(&nonce, &sealed, &mut out).unwrap();
            black_box(out.len())
        })
    });

    group.finish();
}

fn bench_tcp_session(c: &mut Criterion) {
    let payload = vec![0x5Au8; 64 * 1024];
    let mut group = c.benchmark_group("tcp_session_64k");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for method in [
        Method::ChaCha20IetfPoly1305,
        Method::Aes256Gcm,
        Method::ChaCha20Ietf,
        Method::Aes256Cfb,
        Method::Aes128Ctr,
    ] {
        let ctx = CipherContext::new(method, "benchmark");
        group.bench_function(method.name(), |b| {
            b.iter(|| {
                let mut enc = ctx.encryptor(0).unwrap();
                let mut dec = ctx.decryptor();
                let mut wire = BytesMut::with_capacity(payload.len() + 1024);
                enc.encrypt(&payload, &mut wire).unwrap();

                let mut plain = BytesMut::with_capacity(payload.len());
                for piece in wire.chunks(ss_local::RECV_SIZE) {
                    dec.decrypt(piece, &mut plain).unwrap();
                    while dec.has_buffered_chunk() {
                        dec.decrypt(&[], &mut plain).unwrap();
                    }
                }
                black_box(plain.len())
            })
        });
    }

    group.finish();
}

fn bench_udp_packet(c: &mut Criterion) {
    let ctx = CipherContext::new(Method::Aes128Gcm, "benchmark");
    let payload = vec![0u8; 1200];

    let mut group = c.benchmark_group("udp_packet");
    group.throughput(Throughput::Bytes(1200));

    group.bench_function("encrypt_1200", |b| {
        let mut out = BytesMut::with_capacity(2048);
        b.iter(|| {
            out.clear();
            ctx.encrypt_udp(&payload, &mut out).unwrap();
            black_box(out.len())
        })
    });

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    c.bench_function("evp_bytes_to_key_32", |b| {
        b.iter(|| black_box(evp_bytes_to_key(b"correct horse battery staple", 32)))
    });

    let master = [0x42u8; 32];
    let salt = [0x07u8; 32];
    c.bench_function("session_subkey", |b| {
        b.iter(|| black_box(session_subkey(&master, &salt).unwrap()))
    });

    c.bench_function("hkdf_expand_64", |b| {
        b.iter(|| {
            let hkdf = Hkdf::new(Some(&salt), &master);
            black_box(hkdf.expand(b"ss-subkey", 64).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_chunk_seal,
    bench_chunk_open,
    bench_tcp_session,
    bench_udp_packet,
    bench_key_derivation,
);

criterion_main!(benches);
