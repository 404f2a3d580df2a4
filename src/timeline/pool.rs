use crate::driver::{Driver, DriverError, EventHandle};
use crate::host::CctNode;

/// Index into one of the slab pools. Every list in the core (per-stream
/// queues, the retired tail, the sorted kernel list) links records by
/// index; the pool owns the storage.
pub(crate) type Idx = u32;

pub(crate) const NIL: Idx = u32::MAX;

/// One intercepted asynchronous operation, bracketed by a pair of driver
/// timestamp events. Pooled and reused indefinitely; the driver events are
/// created on first allocation and only re-recorded afterwards.
pub(crate) struct EventRecord {
    pub start_event: EventHandle,
    pub end_event: EventHandle,
    /// CPU-epoch microseconds, filled at retirement.
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub stream_id: u32,
    pub launcher: CctNode,
    pub stream_launcher: CctNode,
    /// Synchronizing threads that still need this record for deferred
    /// blame. Zero exactly when no waiter can reach it.
    pub ref_count: u32,
    /// Link in the stream's in-flight queue, the retired tail, or the
    /// freelist; the record is on at most one of them at a time.
    pub next: Idx,
}

pub(crate) struct EventPool {
    slots: Vec<EventRecord>,
    free_head: Idx,
}

impl EventPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
        }
    }

    /// Returns a record for a launch, reusing a pooled one (and its driver
    /// events) when available.
    pub fn acquire(
        &mut self,
        driver: &dyn Driver,
        stream_id: u32,
        launcher: CctNode,
        stream_launcher: CctNode,
    ) -> Result<Idx, DriverError> {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next;
            idx
        } else {
            let start_event = driver.create_event()?;
            let end_event = driver.create_event()?;
            self.slots.push(EventRecord {
                start_event,
                end_event,
                start_time_us: 0,
                end_time_us: 0,
                stream_id: 0,
                launcher: CctNode(0),
                stream_launcher: CctNode(0),
                ref_count: 0,
                next: NIL,
            });
            (self.slots.len() - 1) as Idx
        };
        let rec = &mut self.slots[idx as usize];
        rec.start_time_us = 0;
        rec.end_time_us = 0;
        rec.stream_id = stream_id;
        rec.launcher = launcher;
        rec.stream_launcher = stream_launcher;
        rec.ref_count = 0;
        rec.next = NIL;
        Ok(idx)
    }

    /// A record without driver events, used as the retired tail's
    /// sentinel. Never released.
    pub fn acquire_sentinel(&mut self) -> Idx {
        self.slots.push(EventRecord {
            start_event: EventHandle::NULL,
            end_event: EventHandle::NULL,
            start_time_us: 0,
            end_time_us: 0,
            stream_id: 0,
            launcher: CctNode(0),
            stream_launcher: CctNode(0),
            ref_count: 0,
            next: NIL,
        });
        (self.slots.len() - 1) as Idx
    }

    pub fn release(&mut self, idx: Idx) {
        self.slots[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    pub fn get(&self, idx: Idx) -> &EventRecord {
        &self.slots[idx as usize]
    }

    pub fn get_mut(&mut self, idx: Idx) -> &mut EventRecord {
        &mut self.slots[idx as usize]
    }

    /// Destroys every driver event held by the pool, for context teardown.
    pub fn destroy_driver_events(&mut self, driver: &dyn Driver) -> Result<(), DriverError> {
        for rec in &mut self.slots {
            if rec.start_event != EventHandle::NULL {
                driver.destroy_event(rec.start_event)?;
                driver.destroy_event(rec.end_event)?;
                rec.start_event = EventHandle::NULL;
                rec.end_event = EventHandle::NULL;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            n += 1;
            cur = self.slots[cur as usize].next;
        }
        n
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MarkKind {
    Start,
    End,
}

/// Transient node in the sorted kernel list built during one blame
/// redistribution pass: a kernel's start or end instant. `launcher` is
/// meaningful on start marks, `start` (the partner index) on end marks.
pub(crate) struct KernelMark {
    pub time_us: u64,
    pub kind: MarkKind,
    pub stream_id: u32,
    pub launcher: CctNode,
    pub start: Idx,
    pub next: Idx,
    pub prev: Idx,
}

pub(crate) struct MarkPool {
    slots: Vec<KernelMark>,
    free_head: Idx,
    in_use: usize,
}

impl MarkPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            in_use: 0,
        }
    }

    pub fn acquire(&mut self) -> Idx {
        self.in_use += 1;
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next;
            idx
        } else {
            self.slots.push(KernelMark {
                time_us: 0,
                kind: MarkKind::Start,
                stream_id: 0,
                launcher: CctNode(0),
                start: NIL,
                next: NIL,
                prev: NIL,
            });
            (self.slots.len() - 1) as Idx
        }
    }

    pub fn release(&mut self, idx: Idx) {
        self.in_use -= 1;
        self.slots[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    pub fn get(&self, idx: Idx) -> &KernelMark {
        &self.slots[idx as usize]
    }

    pub fn get_mut(&mut self, idx: Idx) -> &mut KernelMark {
        &mut self.slots[idx as usize]
    }

    /// Marks still outstanding; zero between redistribution passes.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
