use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardsync::config::BackendKind;
use shardsync::distributed::{CollectiveBackend, Communicator, DeviceDispatcher, SingleProcess};
use shardsync::error::Result;
use shardsync::replica::{share, GraphReplica, TrainingBatch};
use shardsync::tensor::Tensor;
use std::sync::Arc;

struct NoBatch;

impl TrainingBatch for NoBatch {
    fn sentences(&self) -> usize {
        0
    }
    fn words(&self) -> usize {
        0
    }
    fn target_words(&self) -> usize {
        0
    }
}

struct Flat {
    device: usize,
    params: Tensor,
    grads: Tensor,
}

impl GraphReplica for Flat {
    type Batch = NoBatch;

    fn build(&mut self, _batch: &NoBatch) -> Result<()> {
        Ok(())
    }
    fn forward(&mut self) -> Result<f32> {
        Ok(0.0)
    }
    fn backward(&mut self) -> Result<()> {
        Ok(())
    }
    fn params(&self) -> &Tensor {
        &self.params
    }
    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }
    fn grads(&self) -> &Tensor {
        &self.grads
    }
    fn grads_mut(&mut self) -> &mut Tensor {
        &mut self.grads
    }
    fn device_id(&self) -> usize {
        self.device
    }
}

fn benchmark_scatter_reduce(c: &mut Criterion) {
    let devices = 4;
    let mut group = c.benchmark_group("scatter_reduce");

    for size in [1 << 16, 1 << 20] {
        let replicas = share(
            (0..devices)
                .map(|device| Flat {
                    device,
                    params: Tensor::zeros(size),
                    grads: Tensor::filled(size, device as f32),
                })
                .collect(),
        );
        let dispatcher = Arc::new(DeviceDispatcher::new(devices).unwrap());

        for parallel in [false, true] {
            let comm = Communicator::select(
                BackendKind::Threaded,
                replicas.clone(),
                Arc::new(SingleProcess),
                None,
                dispatcher.clone(),
                parallel,
            )
            .unwrap();
            let label = if parallel { "parallel" } else { "sequential" };
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| {
                    comm.scatter_reduce_gradients().unwrap();
                    black_box(&comm);
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_scatter_reduce);
criterion_main!(benches);
