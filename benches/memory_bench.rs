// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use cellrx::core::config::MachineConfig;
use cellrx::core::context::Family;
use cellrx::core::memory::layout::PAGE_SIZE;
use cellrx::core::error::Result;
use cellrx::core::memory::{AddressSpace, WatchFn};
use cellrx::core::system::demo::AtomicCounter;
use cellrx::core::system::System;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::rc::Rc;

fn memory_with_page(fast: bool) -> (AddressSpace, u64) {
    let config = MachineConfig::compact();
    let mut mem = AddressSpace::new(&config.memory);
    let block = mem.alloc_phys(PAGE_SIZE, false).unwrap();
    let vaddr = 0x4000_0000;
    mem.map(vaddr, block.start, PAGE_SIZE, fast).unwrap();
    (mem, vaddr)
}

fn access_path_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("access_path");

    for fast in [true, false] {
        let label = if fast { "fast" } else { "slow" };

        group.bench_with_input(BenchmarkId::new("read32", label), &fast, |b, &fast| {
            let (mut mem, vaddr) = memory_with_page(fast);
            b.iter(|| {
                for i in 0..256 {
                    black_box(mem.read::<u32>(black_box(vaddr + i * 4)).unwrap());
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("write32", label), &fast, |b, &fast| {
            let (mut mem, vaddr) = memory_with_page(fast);
            b.iter(|| {
                for i in 0..256 {
                    mem.write::<u32>(vaddr + i * 4, black_box(i as u32)).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn watchpoint_benchmark(c: &mut Criterion) {
    c.bench_function("write32_watched_page", |b| {
        let (mut mem, vaddr) = memory_with_page(true);
        let handler: WatchFn = Rc::new(|_: &mut AddressSpace, _: u64| -> Result<()> { Ok(()) });
        mem.watch_write(vaddr + 0x800, handler);
        b.iter(|| {
            for i in 0..256 {
                mem.write::<u32>(vaddr + i * 4, black_box(i as u32)).unwrap();
            }
        });
    });
}

fn translate_benchmark(c: &mut Criterion) {
    c.bench_function("translate", |b| {
        let (mem, vaddr) = memory_with_page(true);
        b.iter(|| black_box(mem.translate(black_box(vaddr + 0x1234)).unwrap()));
    });
}

fn workload_benchmark(c: &mut Criterion) {
    c.bench_function("atomic_counter_2x2", |b| {
        b.iter(|| {
            let mut system = System::new(MachineConfig::compact()).unwrap();
            let page = system.allocate(PAGE_SIZE, None, false, PAGE_SIZE).unwrap();
            let mut ppu = AtomicCounter::new(Family::Ppu, page.vaddr, 10);
            let mut spu = AtomicCounter::new(Family::Spu, page.vaddr, 10);
            ppu.spawn(&mut system, 2).unwrap();
            spu.spawn(&mut system, 2).unwrap();
            black_box(system.run(&mut ppu, &mut spu, 100_000_000).unwrap());
        });
    });
}

criterion_group!(
    benches,
    access_path_benchmark,
    watchpoint_benchmark,
    translate_benchmark,
    workload_benchmark
);
criterion_main!(benches);
