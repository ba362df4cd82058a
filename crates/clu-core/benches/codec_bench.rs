//! Criterion benchmarks for the CLU frame codec and command cipher.
//!
//! Run with:
//! ```bash
//! cargo bench --package clu-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use clu_core::protocol::commands::{
    DiscoverRequest, DiscoverResponse, LuaScriptRequest, ResetRequest, SetIpRequest,
    SetKeyRequest,
};
use clu_core::protocol::CluCommand;
use clu_core::CipherKey;

// ── Frame fixtures ────────────────────────────────────────────────────────────

fn fixtures() -> Vec<(&'static str, CluCommand)> {
    vec![
        (
            "Discover",
            CluCommand::Discover(DiscoverRequest {
                response_iv: [0x11; 16],
                challenge: [0xA0; 32],
            }),
        ),
        (
            "DiscoverReply",
            CluCommand::DiscoverReply(DiscoverResponse {
                serial: 0xC1,
                mac: [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03],
                temporary_iv: [0x77; 16],
                proof: [0x0F; 32],
            }),
        ),
        (
            "SetIp",
            CluCommand::SetIp(SetIpRequest {
                serial: 0xC1,
                address: "192.168.1.100".parse().unwrap(),
            }),
        ),
        (
            "SetKey",
            CluCommand::SetKey(SetKeyRequest {
                key: [0x42; 16],
                iv: [0x24; 16],
                proof: [0xFE; 32],
            }),
        ),
        ("Reset", CluCommand::Reset(ResetRequest { serial: 0xC1 })),
        (
            "LuaScript",
            CluCommand::LuaScript(LuaScriptRequest {
                session: 1,
                script: "CHECK_ALIVE".to_string(),
            }),
        ),
        ("StartTftpd", CluCommand::StartTftpd),
        ("Error", CluCommand::Error),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `serialize` for every frame kind.
fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    for (name, cmd) in fixtures() {
        group.bench_with_input(BenchmarkId::new("cmd", name), &cmd, |b, cmd| {
            b.iter(|| black_box(cmd).serialize())
        });
    }
    group.finish();
}

/// Benchmarks `parse_any` for every frame kind (from pre-serialized bytes).
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_any");
    for (name, cmd) in fixtures() {
        let bytes = cmd.serialize();
        group.bench_with_input(BenchmarkId::new("cmd", name), &bytes, |b, bytes| {
            b.iter(|| CluCommand::parse_any(black_box(bytes)).expect("parse must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks the full wire path the server pays per packet: decrypt then
/// parse, plus encrypt for the reply.
fn bench_cipher_roundtrip(c: &mut Criterion) {
    let key = CipherKey::new([0x3C; 16], [0x5A; 16]);
    let mut group = c.benchmark_group("cipher_roundtrip");

    let small = CluCommand::Reset(ResetRequest { serial: 0xC1 }).serialize();
    let large = CluCommand::LuaScript(LuaScriptRequest {
        session: 7,
        script: "x = 1\n".repeat(200),
    })
    .serialize();

    for (name, frame) in [("Reset", &small), ("LuaScript_1K", &large)] {
        let ciphertext = key.encrypt(frame);
        group.bench_function(format!("encrypt/{name}"), |b| {
            b.iter(|| key.encrypt(black_box(frame)))
        });
        group.bench_function(format!("decrypt_parse/{name}"), |b| {
            b.iter(|| {
                let plain = key.decrypt(black_box(&ciphertext)).expect("decrypt");
                CluCommand::parse_any(&plain).expect("parse")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_serialize, bench_parse, bench_cipher_roundtrip);
criterion_main!(benches);
