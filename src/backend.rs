//! The serving side of the transport: binds a signal port, maps the shared
//! ring page, and answers block requests against a `BlockIo` implementation
//! until cancelled.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::blkproto::{Abi, BlkOp, BlkStatus, Request, Response};
use crate::ring::{Back, Sring};
use crate::sizes;
use crate::vhd::Vhd;

/// Grant-mapping permission as the hypervisor encodes it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Permission {
    ReadOnly = 1,
    ReadWrite = 3,
}

/// A bound cross-domain interrupt line. `notify` raises the event; both
/// ends of the channel observe it, so it also serves as a local re-wake.
pub trait SignalPort: Send + Sync + 'static {
    fn notify(&self);
    /// Blocks until the event fires; `Err` once the port is unbound.
    fn wait(&self) -> io::Result<()>;
    fn unbind(&self);
    /// For integration with an external poller, where the port has one.
    fn fd(&self) -> Option<i32> {
        None
    }
}

/// Factory for signal ports.
pub trait SignalPorts {
    type Port: SignalPort;
    fn bind_interdomain(&self, remote_domid: u16, remote_port: u32) -> io::Result<Self::Port>;
}

/// Scoped access to pages another domain granted us: map, run, unmap on
/// every exit path.
pub trait GrantTable: Send + Sync + 'static {
    fn with_ref<R>(
        &self,
        domid: u16,
        gref: u32,
        perm: Permission,
        body: impl FnOnce(&mut [u8]) -> io::Result<R>,
    ) -> io::Result<R>;
}

/// What the backend serves: sector I/O against one shared page, where
/// `first`/`last` bound the page's 512-byte sectors being transferred.
pub trait BlockIo: Send + Sync + 'static {
    fn read(&self, page: &mut [u8], sector: u64, first: u8, last: u8) -> io::Result<()>;
    fn write(&self, page: &[u8], sector: u64, first: u8, last: u8) -> io::Result<()>;
}

/// Seconds between defensive self-wakes; recovers from a lost event edge.
const POKE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Backend;

impl Backend {
    /// Binds the port, maps the ring, and starts the service and poker
    /// threads. The returned handle tears everything down on `cancel` or
    /// drop.
    pub fn spawn<G, P, O>(
        domid: u16,
        ring_ref: u32,
        evtchn: u32,
        abi: Abi,
        grants: Arc<G>,
        ports: &impl SignalPorts<Port = P>,
        ops: Arc<O>,
    ) -> io::Result<BackendHandle<P>>
    where
        G: GrantTable,
        P: SignalPort,
        O: BlockIo,
    {
        let port = Arc::new(ports.bind_interdomain(domid, evtchn)?);
        let stop = Arc::new(AtomicBool::new(false));
        let pace = Arc::new((Mutex::new(false), Condvar::new()));

        log::info!("vbd backend up: domid {} ring {} abi {:?}", domid, ring_ref, abi.resolve());

        let service = {
            let (port, stop, grants, ops) =
                (port.clone(), stop.clone(), grants.clone(), ops.clone());
            thread::Builder::new()
                .name(format!("vbd-backend-{}", domid))
                .spawn(move || {
                    let served = grants.with_ref(domid, ring_ref, Permission::ReadWrite, |page| {
                        service_loop(page, abi, domid, &*grants, &*port, &*ops, &stop);
                        Ok(())
                    });
                    if let Err(e) = served {
                        log::warn!("backend for domid {} lost its ring: {}", domid, e);
                    }
                })?
        };

        let poker = {
            let (port, pace) = (port.clone(), pace.clone());
            thread::Builder::new()
                .name(format!("vbd-poker-{}", domid))
                .spawn(move || {
                    let (lock, cv) = &*pace;
                    let mut stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
                    while !*stopped {
                        let (guard, _) = cv
                            .wait_timeout(stopped, POKE_INTERVAL)
                            .unwrap_or_else(|e| e.into_inner());
                        stopped = guard;
                        if !*stopped {
                            port.notify();
                        }
                    }
                })?
        };

        Ok(BackendHandle {
            stop,
            pace,
            port,
            service: Some(service),
            poker: Some(poker),
        })
    }
}

/// Owns the running backend; cancellation unbinds the port, stops both
/// threads, and unmaps the ring on the service thread's way out.
pub struct BackendHandle<P: SignalPort> {
    stop: Arc<AtomicBool>,
    pace: Arc<(Mutex<bool>, Condvar)>,
    port: Arc<P>,
    service: Option<thread::JoinHandle<()>>,
    poker: Option<thread::JoinHandle<()>>,
}

impl<P: SignalPort> BackendHandle<P> {
    pub fn cancel(&mut self) {
        if self.service.is_none() && self.poker.is_none() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        {
            let (lock, cv) = &*self.pace;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
            cv.notify_all();
        }
        self.port.unbind();
        if let Some(t) = self.service.take() {
            let _ = t.join();
        }
        if let Some(t) = self.poker.take() {
            let _ = t.join();
        }
        log::debug!("vbd backend torn down");
    }
}

impl<P: SignalPort> Drop for BackendHandle<P> {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn service_loop<G: GrantTable, O: BlockIo>(
    page: &mut [u8],
    abi: Abi,
    domid: u16,
    grants: &G,
    port: &impl SignalPort,
    ops: &O,
    stop: &AtomicBool,
) {
    let slot_size = abi.slot_size();
    let sring = unsafe { Sring::new(page.as_mut_ptr(), slot_size) };
    let mut back = Back::new(sring);
    let mut slot = vec![0_u8; slot_size];

    'serve: loop {
        while back.unconsumed_requests() != 0 {
            if stop.load(Ordering::Acquire) {
                break 'serve;
            }
            back.request_at(back.req_cons(), &mut slot);
            back.advance_req_cons();

            let response = handle_request(abi, domid, grants, ops, &slot);
            let (more_to_do, notify) = back.write_response(&response.marshal());
            if notify {
                port.notify();
            }
            if more_to_do {
                continue;
            }
        }

        if stop.load(Ordering::Acquire) {
            break;
        }
        if back.final_check_for_requests() {
            continue;
        }
        if port.wait().is_err() {
            break;
        }
    }
}

fn handle_request<G: GrantTable, O: BlockIo>(
    abi: Abi,
    domid: u16,
    grants: &G,
    ops: &O,
    slot: &[u8],
) -> Response {
    let req = match Request::parse(abi, slot) {
        Ok(req) => req,
        Err(e) => {
            log::debug!("rejecting malformed request slot: {}", e);
            return Response {
                id: Request::peek_id(abi, slot),
                op: Request::peek_op(slot),
                status: BlkStatus::NotSupported,
            };
        }
    };

    let write = match req.op {
        BlkOp::Read => false,
        BlkOp::Write => true,
        // barriers and flushes are not implemented here
        other => {
            return Response { id: req.id, op: other, status: BlkStatus::NotSupported };
        }
    };
    // the backend writes read results *into* the guest page
    let perm = if write { Permission::ReadOnly } else { Permission::ReadWrite };

    let mut sector_offsets = Vec::with_capacity(req.segments.len());
    let mut off = 0_u64;
    for seg in &req.segments {
        sector_offsets.push(off);
        off += seg.sector_count();
    }

    let outcome: io::Result<()> = thread::scope(|s| {
        let tasks: Vec<_> = req
            .segments
            .iter()
            .zip(&sector_offsets)
            .map(|(seg, &seg_off)| {
                let sector = req.sector + seg_off;
                s.spawn(move || {
                    grants.with_ref(domid, seg.gref, perm, |data_page| {
                        if write {
                            ops.write(data_page, sector, seg.first_sector, seg.last_sector)
                        } else {
                            ops.read(data_page, sector, seg.first_sector, seg.last_sector)
                        }
                    })
                })
            })
            .collect();

        let mut result = Ok(());
        for task in tasks {
            let joined = task
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "segment task panicked"))
                .and_then(|r| r);
            if let Err(e) = joined {
                log::debug!("segment I/O failed for request {}: {}", req.id, e);
                result = Err(e);
            }
        }
        result
    });

    let status = match outcome {
        Ok(()) => BlkStatus::Ok,
        Err(_) => BlkStatus::Error,
    };
    Response { id: req.id, op: req.op, status }
}

/// `BlockIo` over a VHD image; serializes the single-writer engine behind
/// a lock.
pub struct VhdIo {
    vhd: Mutex<Vhd>,
}

impl VhdIo {
    pub fn new(vhd: Vhd) -> Self {
        VhdIo { vhd: Mutex::new(vhd) }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Vhd) -> R) -> R {
        let mut vhd = self.vhd.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut vhd)
    }
}

const SECTOR: usize = sizes::SECTOR as usize;

fn check_page_span(page: &[u8], first: u8, last: u8) -> io::Result<()> {
    if first > last || last >= sizes::SECTORS_PER_PAGE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad sector span"));
    }
    if page.len() < (last as usize + 1) * SECTOR {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "short page"));
    }
    Ok(())
}

fn to_io_error(e: crate::VbdError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

impl BlockIo for VhdIo {
    fn read(&self, page: &mut [u8], sector: u64, first: u8, last: u8) -> io::Result<()> {
        check_page_span(page, first, last)?;
        let vhd = self.vhd.lock().unwrap_or_else(|e| e.into_inner());
        for i in first..=last {
            let data = vhd
                .read_sector(sector + (i - first) as u64)
                .map_err(to_io_error)?;
            page[i as usize * SECTOR..(i as usize + 1) * SECTOR].copy_from_slice(&data);
        }
        Ok(())
    }

    fn write(&self, page: &[u8], sector: u64, first: u8, last: u8) -> io::Result<()> {
        check_page_span(page, first, last)?;
        let mut vhd = self.vhd.lock().unwrap_or_else(|e| e.into_inner());
        for i in first..=last {
            let data: &[u8; SECTOR] = page[i as usize * SECTOR..(i as usize + 1) * SECTOR]
                .try_into()
                .unwrap();
            vhd.write_sector(sector + (i - first) as u64, data)
                .map_err(to_io_error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkproto::{Segment, REQUEST_SLOT_SIZE_X86_64, RESPONSE_SIZE};
    use crate::ring::Front;
    use crate::vhd::CreateOptions;
    use crate::Uuid;
    use std::cell::UnsafeCell;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// A stand-in for foreign shared memory: access is governed by the
    /// ring protocol, not by `&mut` exclusivity.
    struct SharedPage(UnsafeCell<[u8; sizes::PAGE]>);
    unsafe impl Sync for SharedPage {}
    unsafe impl Send for SharedPage {}

    impl SharedPage {
        fn new() -> Arc<Self> {
            Arc::new(SharedPage(UnsafeCell::new([0_u8; sizes::PAGE])))
        }

        fn ptr(&self) -> *mut u8 {
            self.0.get() as *mut u8
        }

        #[allow(clippy::mut_from_ref)]
        unsafe fn slice(&self) -> &mut [u8] {
            &mut *self.0.get()
        }
    }

    struct TestGrants {
        pages: Mutex<HashMap<u32, Arc<SharedPage>>>,
    }

    impl TestGrants {
        fn new() -> Self {
            TestGrants { pages: Mutex::new(HashMap::new()) }
        }

        fn insert(&self, gref: u32) -> Arc<SharedPage> {
            let page = SharedPage::new();
            self.pages.lock().unwrap().insert(gref, page.clone());
            page
        }
    }

    impl GrantTable for TestGrants {
        fn with_ref<R>(
            &self,
            _domid: u16,
            gref: u32,
            _perm: Permission,
            body: impl FnOnce(&mut [u8]) -> io::Result<R>,
        ) -> io::Result<R> {
            let page = self
                .pages
                .lock()
                .unwrap()
                .get(&gref)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such grant"))?;
            body(unsafe { page.slice() })
        }
    }

    #[derive(Default)]
    struct PortState {
        pending: bool,
        closed: bool,
    }

    #[derive(Clone)]
    struct TestPort(Arc<(Mutex<PortState>, Condvar)>);

    impl TestPort {
        fn new() -> Self {
            TestPort(Arc::new((Mutex::new(PortState::default()), Condvar::new())))
        }
    }

    impl SignalPort for TestPort {
        fn notify(&self) {
            let (lock, cv) = &*self.0;
            lock.lock().unwrap().pending = true;
            cv.notify_all();
        }

        fn wait(&self) -> io::Result<()> {
            let (lock, cv) = &*self.0;
            let mut st = lock.lock().unwrap();
            while !st.pending && !st.closed {
                st = cv.wait(st).unwrap();
            }
            if st.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unbound"));
            }
            st.pending = false;
            Ok(())
        }

        fn unbind(&self) {
            let (lock, cv) = &*self.0;
            lock.lock().unwrap().closed = true;
            cv.notify_all();
        }
    }

    struct TestPorts(TestPort);

    impl SignalPorts for TestPorts {
        type Port = TestPort;
        fn bind_interdomain(&self, _domid: u16, _port: u32) -> io::Result<TestPort> {
            Ok(self.0.clone())
        }
    }

    const RING_GREF: u32 = 1;
    const SLOT: usize = REQUEST_SLOT_SIZE_X86_64;

    struct Rig {
        handle: BackendHandle<TestPort>,
        front: Front,
        port: TestPort,
        grants: Arc<TestGrants>,
        ops: Arc<VhdIo>,
        _ring_page: Arc<SharedPage>,
    }

    /// A backend over a fresh 4 MiB dynamic disk with sectors 0..16 stamped
    /// with their own index.
    fn rig() -> (tempfile::TempDir, Rig) {
        let dir = tempdir().unwrap();
        let mut vhd = Vhd::create_new_dynamic(
            dir.path().join("t.vhd"),
            4 * sizes::MIB,
            Uuid::new_v4(),
            CreateOptions::default(),
        )
        .unwrap();
        for s in 0..16_u64 {
            vhd.write_sector(s, &[s as u8; SECTOR]).unwrap();
        }
        let ops = Arc::new(VhdIo::new(vhd));

        let grants = Arc::new(TestGrants::new());
        let ring_page = grants.insert(RING_GREF);
        let port = TestPort::new();
        let ports = TestPorts(port.clone());

        let handle =
            Backend::spawn(0, RING_GREF, 0, Abi::X86_64, grants.clone(), &ports, ops.clone())
                .unwrap();
        let front = Front::new(unsafe { Sring::new(ring_page.ptr(), SLOT) });

        (dir, Rig { handle, front, port, grants, ops, _ring_page: ring_page })
    }

    fn submit(rig: &mut Rig, req: &Request) -> Response {
        let bytes = req.marshal(Abi::X86_64).unwrap();
        rig.front.write_request(&bytes);
        rig.front.push_requests();
        rig.port.notify();

        for _ in 0..500 {
            if rig.front.unconsumed_responses() != 0 {
                let mut rsp = [0_u8; RESPONSE_SIZE];
                rig.front.response_at(rig.front.rsp_cons(), &mut rsp);
                rig.front.advance_rsp_cons();
                return Response::parse(&rsp).unwrap();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("no response from backend");
    }

    #[test]
    fn read_request_fills_the_guest_page() {
        let (_dir, mut rig) = rig();
        let data = rig.grants.insert(42);

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 0x1122,
                sector: 0,
                segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 7 }],
            },
        );
        assert_eq!(rsp, Response { id: 0x1122, op: BlkOp::Read, status: BlkStatus::Ok });

        let page = unsafe { data.slice() };
        for s in 0..8_usize {
            assert!(page[s * SECTOR..(s + 1) * SECTOR].iter().all(|b| *b == s as u8));
        }
    }

    #[test]
    fn write_request_lands_in_the_image() {
        let (_dir, mut rig) = rig();
        let data = rig.grants.insert(42);
        unsafe { data.slice() }.fill(0x5A);

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Write,
                handle: 7,
                id: 2,
                sector: 100,
                segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 7 }],
            },
        );
        assert_eq!(rsp.status, BlkStatus::Ok);

        rig.ops.with(|vhd| {
            for s in 100..108 {
                assert_eq!(vhd.read_sector(s).unwrap(), [0x5A; SECTOR]);
            }
            assert_eq!(vhd.read_sector(108).unwrap(), [0_u8; SECTOR]);
        });
    }

    #[test]
    fn segments_dispatch_at_their_sector_offsets() {
        let (_dir, mut rig) = rig();
        let first = rig.grants.insert(42);
        let second = rig.grants.insert(43);

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 3,
                sector: 0,
                segments: vec![
                    Segment { gref: 42, first_sector: 0, last_sector: 7 },
                    Segment { gref: 43, first_sector: 0, last_sector: 7 },
                ],
            },
        );
        assert_eq!(rsp.status, BlkStatus::Ok);

        // second segment starts where the first left off: device sector 8
        let page = unsafe { second.slice() };
        for s in 0..8_usize {
            assert!(page[s * SECTOR..(s + 1) * SECTOR]
                .iter()
                .all(|b| *b == (s + 8) as u8));
        }
        let page = unsafe { first.slice() };
        assert!(page[..SECTOR].iter().all(|b| *b == 0));
    }

    #[test]
    fn single_sector_segment_touches_only_its_slot() {
        let (_dir, mut rig) = rig();
        let data = rig.grants.insert(42);
        unsafe { data.slice() }.fill(0xEE);

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 4,
                sector: 5,
                segments: vec![Segment { gref: 42, first_sector: 3, last_sector: 3 }],
            },
        );
        assert_eq!(rsp.status, BlkStatus::Ok);

        let page = unsafe { data.slice() };
        assert!(page[3 * SECTOR..4 * SECTOR].iter().all(|b| *b == 5));
        assert!(page[..3 * SECTOR].iter().all(|b| *b == 0xEE));
        assert!(page[4 * SECTOR..].iter().all(|b| *b == 0xEE));
    }

    #[test]
    fn eleven_segments_cover_the_full_span() {
        let (_dir, mut rig) = rig();
        let pages: Vec<_> = (0..11).map(|i| rig.grants.insert(100 + i)).collect();

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 5,
                sector: 0,
                segments: (0..11)
                    .map(|i| Segment { gref: 100 + i, first_sector: 0, last_sector: 0 })
                    .collect(),
            },
        );
        assert_eq!(rsp.status, BlkStatus::Ok);

        for (i, page) in pages.iter().enumerate().take(11) {
            let page = unsafe { page.slice() };
            assert!(page[..SECTOR].iter().all(|b| *b == i as u8), "segment {}", i);
        }
    }

    #[test]
    fn flush_and_barrier_are_not_supported() {
        let (_dir, mut rig) = rig();
        let _ = rig.grants.insert(42);

        for op in [BlkOp::Flush, BlkOp::WriteBarrier, BlkOp::Unknown(9)] {
            let rsp = submit(
                &mut rig,
                &Request {
                    op,
                    handle: 7,
                    id: 6,
                    sector: 0,
                    segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 0 }],
                },
            );
            assert_eq!(rsp, Response { id: 6, op, status: BlkStatus::NotSupported });
        }
    }

    #[test]
    fn malformed_slot_answers_not_supported_and_ring_survives() {
        let (_dir, mut rig) = rig();
        let data = rig.grants.insert(42);

        // nr_segs = 0 is a protocol error
        let mut raw = Request {
            op: BlkOp::Read,
            handle: 7,
            id: 0xBAD,
            sector: 0,
            segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 0 }],
        }
        .marshal(Abi::X86_64)
        .unwrap();
        raw[1] = 0;
        rig.front.write_request(&raw);
        rig.front.push_requests();
        rig.port.notify();

        let mut rsp = None;
        for _ in 0..500 {
            if rig.front.unconsumed_responses() != 0 {
                let mut buf = [0_u8; RESPONSE_SIZE];
                rig.front.response_at(rig.front.rsp_cons(), &mut buf);
                rig.front.advance_rsp_cons();
                rsp = Some(Response::parse(&buf).unwrap());
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let rsp = rsp.expect("no response to the malformed slot");
        assert_eq!(rsp.id, 0xBAD);
        assert_eq!(rsp.status, BlkStatus::NotSupported);

        // the ring keeps serving
        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 7,
                sector: 0,
                segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 0 }],
            },
        );
        assert_eq!(rsp.status, BlkStatus::Ok);
        let _ = data;
    }

    #[test]
    fn unknown_grant_degrades_to_error() {
        let (_dir, mut rig) = rig();

        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 8,
                sector: 0,
                segments: vec![Segment { gref: 999, first_sector: 0, last_sector: 0 }],
            },
        );
        assert_eq!(rsp, Response { id: 8, op: BlkOp::Read, status: BlkStatus::Error });
    }

    #[test]
    fn out_of_range_sector_degrades_to_error() {
        let (_dir, mut rig) = rig();
        let _ = rig.grants.insert(42);

        // 4 MiB disk has 8192 sectors
        let rsp = submit(
            &mut rig,
            &Request {
                op: BlkOp::Read,
                handle: 7,
                id: 9,
                sector: 8192,
                segments: vec![Segment { gref: 42, first_sector: 0, last_sector: 0 }],
            },
        );
        assert_eq!(rsp.status, BlkStatus::Error);
    }

    #[test]
    fn cancel_unbinds_and_joins() {
        let (_dir, mut rig) = rig();
        rig.handle.cancel();
        // port is unbound: a waiter errors out instead of blocking
        assert!(rig.port.wait().is_err());
        // cancelling again is a no-op
        rig.handle.cancel();
    }
}
