//! Benchmark: convolution methods and scheduling strategies through a full session.

use std::time::Instant;

use kiln_core::{ConvolutionMethod, DataType, PadStrideInfo, Size2D, TensorDescriptor};
use kiln_graph::builder::*;
use kiln_graph::{Graph, GraphConfig, GraphSession, MethodHintPolicy, NodeParams, RandomAccessor};
use kiln_runtime::SchedulingStrategy;

fn conv_graph(size: usize, channels: usize, filters: usize, method: ConvolutionMethod) -> Graph {
    let mut g = Graph::new("bench");
    let x = add_input_node(
        &mut g,
        NodeParams::new("x"),
        TensorDescriptor::new([1, size, size, channels], DataType::F32),
        Some(Box::new(RandomAccessor::new(1, -1.0, 1.0))),
    )
    .unwrap();
    let conv = add_convolution_node(
        &mut g,
        NodeParams::new("conv"),
        x.into(),
        Size2D::new(3, 3),
        filters,
        PadStrideInfo::new(1, 1, 1, 1),
        method,
        Some(Box::new(RandomAccessor::new(2, -0.1, 0.1))),
        Some(Box::new(RandomAccessor::new(3, -0.1, 0.1))),
    )
    .unwrap();
    add_output_node(&mut g, NodeParams::new("y"), conv.into(), None).unwrap();
    g
}

fn bench(size: usize, channels: usize, filters: usize, method: ConvolutionMethod, config: GraphConfig, iters: usize) -> f64 {
    let config = config.with_method_hint_policy(MethodHintPolicy::Strict);
    let mut session = GraphSession::with_config(conv_graph(size, channels, filters, method), config).unwrap();
    // First run pays for prepare.
    session.run().unwrap();
    let start = Instant::now();
    for _ in 0..iters {
        session.run().unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn gflops(size: usize, channels: usize, filters: usize, secs: f64) -> f64 {
    (2.0 * (size * size * filters) as f64 * (9 * channels) as f64) / secs / 1e9
}

fn main() {
    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    println!("=== kiln 3x3 convolution benchmark ({threads} threads) ===\n");

    let shapes: &[(usize, usize, usize)] = &[(28, 8, 16), (56, 16, 32), (112, 32, 32)];
    let methods = [ConvolutionMethod::Direct, ConvolutionMethod::Gemm, ConvolutionMethod::Winograd];

    println!(
        "{:<16} {:>12} {:>12} {:>12} {:>12}",
        "Shape", "Direct (ms)", "Gemm (ms)", "Winograd (ms)", "best GF/s"
    );
    println!("{}", "-".repeat(68));
    for &(size, channels, filters) in shapes {
        let iters = if size <= 28 { 50 } else if size <= 56 { 10 } else { 3 };
        let times: Vec<f64> = methods
            .iter()
            .map(|&m| bench(size, channels, filters, m, GraphConfig::default(), iters))
            .collect();
        let best = times.iter().copied().fold(f64::INFINITY, f64::min);
        println!(
            "{:<16} {:>10.3}ms {:>10.3}ms {:>10.3}ms {:>12.2}",
            format!("{size}x{size}x{channels}->{filters}"),
            times[0] * 1000.0,
            times[1] * 1000.0,
            times[2] * 1000.0,
            gflops(size, channels, filters, best),
        );
    }

    println!("\n=== Scheduling strategy (Gemm) ===\n");
    println!("{:<16} {:>12} {:>12}", "Shape", "Static (ms)", "Dynamic (ms)");
    println!("{}", "-".repeat(42));
    for &(size, channels, filters) in shapes {
        let iters = if size <= 28 { 50 } else if size <= 56 { 10 } else { 3 };
        let run = |strategy| {
            let config = GraphConfig::default().with_scheduling_strategy(strategy);
            bench(size, channels, filters, ConvolutionMethod::Gemm, config, iters)
        };
        println!(
            "{:<16} {:>10.3}ms {:>10.3}ms",
            format!("{size}x{size}x{channels}->{filters}"),
            run(SchedulingStrategy::Static) * 1000.0,
            run(SchedulingStrategy::Dynamic) * 1000.0,
        );
    }
}
