use arbor::{
    locate_signature, AccessConfig, ContainerFile, CreateConfig, FsStrategy, MemoryMedium,
    MemoryObjectHeaders, Sizes, Superblock,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_codec(c: &mut Criterion) {
    let sizes = Sizes::default();
    for version in 0..=3u8 {
        let mut sb = Superblock::new(version, sizes).unwrap();
        sb.eoa = 1 << 20;
        let bytes = sb.encode().unwrap();

        c.bench_function(&format!("encode_v{version}"), |b| b.iter(|| black_box(&sb).encode().unwrap()));
        c.bench_function(&format!("decode_v{version}"), |b| {
            b.iter(|| Superblock::decode(black_box(&bytes), 0).unwrap())
        });
    }
}

fn bench_locate(c: &mut Criterion) {
    // Signature behind a 512 KiB user block in a 1 MiB image.
    let offset = 512 << 10;
    let mut image = vec![0u8; offset];
    image.extend_from_slice(&Superblock::new(2, Sizes::default()).unwrap().encode().unwrap());
    image.resize(1 << 20, 0);

    c.bench_function("locate_signature_1mb", |b| {
        b.iter(|| {
            let mut medium = MemoryMedium::from_bytes(image.clone());
            locate_signature(black_box(&mut medium)).unwrap()
        })
    });
}

fn bench_create_close(c: &mut Criterion) {
    let create = CreateConfig { fs_strategy: Some(FsStrategy::Aggr), shared_indexes: 2, ..Default::default() };

    c.bench_function("create_close_with_extension", |b| {
        b.iter(|| {
            let file = ContainerFile::create(
                MemoryMedium::new(),
                MemoryObjectHeaders::new(),
                black_box(create.clone()),
                AccessConfig::default(),
            )
            .unwrap();
            file.close().unwrap()
        })
    });
}

criterion_group!(benches, bench_codec, bench_locate, bench_create_close);
criterion_main!(benches);
