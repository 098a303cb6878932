use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mailarc::codec::{Codec, BrotliCodec, GzipCodec, Lz4Codec, ZstdCodec};
use mailarc::container::BlockContainer;
use mailarc::email_batch::EmailBatchWriter;
use mailarc::{BlockHeader, BlockType, Flags, PayloadEncoding};

fn bench_compression(c: &mut Criterion) {
    let data = vec![b'm'; 1024 * 1024];
    let gzip = GzipCodec;
    let lz4 = Lz4Codec;
    let zstd = ZstdCodec;
    let brotli = BrotliCodec;
    c.bench_function("gzip_compress_1mb", |b| b.iter(|| gzip.compress(black_box(&data), 6)));
    c.bench_function("lz4_compress_1mb", |b| b.iter(|| lz4.compress(black_box(&data), 0)));
    c.bench_function("zstd_compress_1mb", |b| b.iter(|| zstd.compress(black_box(&data), 3)));
    c.bench_function("brotli_compress_1mb", |b| b.iter(|| brotli.compress(black_box(&data), 5)));
}

fn bench_batch_writer(c: &mut Criterion) {
    let body = vec![b'e'; 8 * 1024];
    c.bench_function("email_batch_add_email_8kb", |b| {
        b.iter(|| {
            let mut writer = EmailBatchWriter::new(0, Some(1024 * 1024));
            for i in 0..50u32 {
                writer.add_email([i as u8; 32], [i as u8; 32], black_box(body.clone()));
            }
            writer.serialize_batch()
        })
    });
}

fn bench_container_write_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let container = BlockContainer::open(dir.path().join("bench.mailarc")).unwrap();
    let payload = vec![b'p'; 64 * 1024];

    c.bench_function("container_write_64kb", |b| {
        let mut id = 1i64;
        b.iter(|| {
            let header = BlockHeader {
                version: 1,
                block_type: BlockType::EmailBatch,
                flags: Flags::default(),
                payload_encoding: PayloadEncoding::RawBytes,
                timestamp: 0,
                block_id: id,
                payload_length: payload.len() as i64,
            };
            container.write(&header, black_box(&payload)).unwrap();
            id += 1;
        })
    });

    c.bench_function("container_read_64kb", |b| {
        b.iter(|| container.read(black_box(1)).unwrap())
    });
}

criterion_group!(benches, bench_compression, bench_batch_writer, bench_container_write_read);
criterion_main!(benches);
