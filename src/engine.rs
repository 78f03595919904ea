//! Fan partitions out to workers, merge what comes back.
pub mod molecule;
pub mod partition;
pub mod worker;

use crate::matrix::{CountMatrix, PartialCounts};
use anyhow::{Context, Result, anyhow};
use partition::Partition;
use rayon::prelude::*;
use worker::{PartitionCounter, WorkerSettings, count_partition};

fn count_one<W: PartitionCounter>(
    counter: &W,
    settings: &WorkerSettings,
    partition: &Partition,
) -> Result<PartialCounts<W::Column, W::Value>> {
    count_partition(counter, settings, partition)
        .with_context(|| format!("Failed to count partition {}", partition.str_id()))
}

struct Progress {
    total: usize,
    done: usize,
}

impl Progress {
    fn finished<C: crate::matrix::ColumnKey, V: crate::matrix::Tally>(
        &mut self,
        partial: &PartialCounts<C, V>,
    ) {
        self.done += 1;
        if partial.timed_out {
            log::warn!(
                "Partition {} ran out of time, its counts are incomplete",
                partial.partition
            );
        }
        log::info!(
            "Finished {} ({} of {}, {} remaining)",
            partial.partition,
            self.done,
            self.total,
            self.total - self.done
        );
    }
}

/// Count all partitions and merge the results into one matrix.
///
/// With one thread everything happens on the calling thread. Otherwise
/// workers run on a rayon pool and send their partial counts over a
/// bounded channel, the calling thread merges them as they arrive.
/// The first error stops the run, no partial matrix is returned.
pub fn run_partitions<W: PartitionCounter>(
    counter: &W,
    settings: &WorkerSettings,
    partitions: &[Partition],
    threads: usize,
) -> Result<CountMatrix<W::Column, W::Value>> {
    measure_time::info_time!("Counting {} partitions", partitions.len());
    let mut matrix = CountMatrix::new();
    let mut progress = Progress {
        total: partitions.len(),
        done: 0,
    };
    if threads <= 1 {
        for partition in partitions {
            let partial = count_one(counter, settings, partition)?;
            progress.finished(&partial);
            matrix.update(partial);
        }
        return Ok(matrix);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build counting thread pool")?;
    let (sender, receiver) = crossbeam::channel::bounded(threads * 2);
    std::thread::scope(|scope| -> Result<()> {
        let producer = scope.spawn(move || {
            pool.install(|| {
                partitions
                    .par_iter()
                    .try_for_each_with(sender, |sender, partition| {
                        let partial = count_one(counter, settings, partition)?;
                        sender
                            .send(partial)
                            .map_err(|_| anyhow!("Merger stopped receiving"))
                    })
            })
        });
        // ends once every sender is gone: all done, or aborted
        for partial in receiver.iter() {
            progress.finished(&partial);
            matrix.update(partial);
        }
        producer
            .join()
            .map_err(|_| anyhow!("A counting thread panicked"))?
    })?;
    Ok(matrix)
}
