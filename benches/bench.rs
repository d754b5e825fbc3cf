// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use criterion::*;

use nir_drs::benchmarks::{ExtractCase, HotPixelCase};

fn preprocessing(c: &mut Criterion) {
    let case = HotPixelCase::new(42);
    c.bench_function("clean hot pixels (256x512)", |b| {
        b.iter(|| black_box(case.run()))
    });
}

fn extraction(c: &mut Criterion) {
    let case = ExtractCase::new(42).unwrap();
    c.bench_function("extract orders (6 orders, 512 columns)", |b| {
        b.iter(|| black_box(case.run()))
    });
}

criterion_group!(benches, preprocessing, extraction);
criterion_main!(benches);
