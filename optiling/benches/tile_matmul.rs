use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use optiling::common::{Dtype, TensorDesc};
use optiling::ops::matmul::infer_shape;
use optiling::{default_registry, MemoryHierarchyDescriptor, OperatorWorkload, TilingDispatcher};

const PLATFORM: &str = r#"{
   "hardware_info": {"BT_SIZE": 0, "UB_SIZE": 196608, "L2_SIZE": 33554432, "L1_SIZE": 524288,
                     "L0A_SIZE": 65536, "L0B_SIZE": 65536, "L0C_SIZE": 131072,
                     "CORE_NUM": 40},
   "version": {"Short_SoC_version": "Ascend910B"}
}"#;

#[export_name = "optiling_bench_tile_matmul::platform"]
fn platform() -> MemoryHierarchyDescriptor {
    TilingDispatcher::parse_platform(PLATFORM).unwrap()
}

#[export_name = "optiling_bench_tile_matmul::matmul_workload"]
fn matmul_workload(m: i64, k: i64, n: i64) -> OperatorWorkload {
    let (x1, x2) = ([m, k], [k, n]);
    let y = infer_shape("MatMulV3", &x1, &x2, None, false, false).unwrap();
    OperatorWorkload::new("MatMulV3")
        .with_input(TensorDesc::nd(&x1, Dtype::Float16))
        .with_input(TensorDesc::nd(&x2, Dtype::Float16))
        .with_output(TensorDesc::nd(&y, Dtype::Float16))
}

#[library_benchmark]
fn tile_matmul_sweep() {
    let dispatcher = TilingDispatcher::new(default_registry(), platform());
    for size in [64, 256, 1024, 4096] {
        let w = matmul_workload(size, size, size);
        black_box(dispatcher.tile(black_box(&w)).unwrap());
    }
}

#[library_benchmark]
fn tile_matmul_skinny() {
    let dispatcher = TilingDispatcher::new(default_registry(), platform());
    let w = matmul_workload(16, 8192, 16);
    for _ in 0..100 {
        black_box(dispatcher.tile(black_box(&w)).unwrap());
    }
}

library_benchmark_group!(
    name = tile_matmul_group;
    benchmarks = tile_matmul_sweep, tile_matmul_skinny
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "toggle-collect=optiling_bench_tile_matmul::platform",
                    "toggle-collect=optiling_bench_tile_matmul::matmul_workload",
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                ]);
    library_benchmark_groups = tile_matmul_group
);
