//! The background harvester: a clock sweep that ages frames, trickles
//! dirty ones out, and reclaims victims under free-list pressure.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{select, Receiver, Sender};

use crate::config::CM_GCLOCK_AGE;

use super::frame::FrameFlags;
use super::{io, CmgrShared};

pub(crate) struct Harvester {
    thread: Option<JoinHandle<()>>,
    shutdown_tx: Sender<()>,
}

impl Harvester {
    pub fn spawn(shared: Arc<CmgrShared>, wake_rx: Receiver<()>) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("cm-harvester".to_string())
            .spawn(move || run(shared, wake_rx, shutdown_rx))
            .expect("failed to spawn harvester thread");
        Self { thread: Some(thread), shutdown_tx }
    }

    /// Post the shutdown signal and wait for the sweep to drain.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(shared: Arc<CmgrShared>, wake_rx: Receiver<()>, shutdown_rx: Receiver<()>) {
    let bcount = shared.tuning.bcount;
    let bsize = shared.tuning.bsize;
    if bcount == 0 {
        return;
    }
    log::debug!(
        "harvester running [low {}, high {}, total {}]",
        shared.tuning.low_water,
        shared.tuning.high_water,
        bcount
    );

    let mut victim = 0usize;
    let mut num_freed = 0usize;
    let mut num_written = 0usize;
    let mut num_fixed = 0usize;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        if shared.pool.num_free() >= shared.tuning.high_water {
            log::trace!(
                "harvester idle [{} >= {}]",
                shared.pool.num_free(),
                shared.tuning.high_water
            );
            select! {
                recv(wake_rx) -> _ => {}
                recv(shutdown_rx) -> _ => break,
            }
            continue;
        }

        let frame = shared.pool.frame(victim);
        match frame.try_lock() {
            None => {
                // Locked means in use; hands off. A full sweep of nothing
                // but locked frames cannot make progress ever again.
                num_fixed += 1;
                if num_fixed >= bcount {
                    log::error!("harvester found every frame locked; pool is wedged");
                    log::error!("increase CMGR_BCOUNT and/or CMGR_BSIZE to avoid this");
                    std::process::exit(1);
                }
            }
            Some(mut g) => {
                if g.fix > 0 {
                    shared.stats.scan();
                } else if g.flags.contains(FrameFlags::FREE) {
                    num_fixed = 0;
                    shared.stats.scan();
                } else if !g.flags.contains(FrameFlags::INVALID)
                    && g.gclock_ref - CM_GCLOCK_AGE > 0
                {
                    // Young enough to survive this sweep; age it, and use
                    // the visit to trickle dirty data out.
                    num_fixed = 0;
                    g.gclock_ref -= CM_GCLOCK_AGE;
                    shared.stats.scan();
                    if g.flags.contains(FrameFlags::DIRTY) {
                        log::debug!("trickle writeback of frame {}", g.id());
                        let _ = io::wb_sync(
                            std::slice::from_mut(&mut g),
                            &*shared.backend,
                            bsize,
                            &shared.stats,
                        );
                        num_written += 1;
                    }
                } else {
                    // Victim. The frame lock must be dropped before the
                    // chain lock is taken; the deletion re-locks with try
                    // and re-checks the key, aborting if it raced.
                    num_fixed = 0;
                    g.gclock_ref = 0;
                    let old_key = g.key.clone();
                    drop(g);

                    match shared.blocks.del(&shared.pool, victim, &old_key, false) {
                        Err(()) => {
                            log::debug!("victim frame {} was re-homed, skipping", victim);
                            shared.stats.scan();
                        }
                        Ok(mut g) => {
                            let mut failed_wb: i64 = 0;
                            if g.flags.contains(FrameFlags::DIRTY) {
                                log::debug!("delayed writeback of frame {}", g.id());
                                failed_wb = io::wb_sync(
                                    std::slice::from_mut(&mut g),
                                    &*shared.backend,
                                    bsize,
                                    &shared.stats,
                                );
                            }
                            let invalid = g.flags.contains(FrameFlags::INVALID);
                            drop(g);
                            // Invalidated frames were unhooked from their
                            // file when they were evicted.
                            if !invalid {
                                shared.files.remove_frame(
                                    victim,
                                    &old_key.handle,
                                    if failed_wb < 0 { failed_wb as i32 } else { 0 },
                                );
                            }
                            shared.pool.release(victim);
                            shared.stats.harvest();
                            num_freed += 1;

                            if num_freed + num_written >= shared.tuning.batch {
                                num_freed = 0;
                                num_written = 0;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }
        }
        victim = (victim + 1) % bcount;
    }

    // Drain: push all remaining dirty data out before the thread dies.
    shared.wb_all();
    log::debug!("harvester exiting");
}
