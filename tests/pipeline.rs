//! End-to-end: telemetry appended to the ring buffer travels through the
//! log-file controller and a minimal flat filesystem into sector storage.

use embedded_datalog::{
    block_device::BlockDevice,
    fs::storage::{AdapterError, RawLock, StorageAdapter},
    CardInfo, ControllerConfig, Filesystem, Hotplug, HotplugHooks, HotplugState, LogDrain,
    LogFileController, MemoryBlockDevice, Monotonic, RingLog, RotationHook,
};

/// Logical blocks (512-byte) reserved per file slot.
const FILE_BLOCKS: u32 = 16;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct NoopLock;

impl RawLock for NoopLock {
    fn lock(&self) {}
    fn unlock(&self) {}
}

struct FlatFile {
    slot: u32,
    len: u32,
}

/// A throwaway filesystem: each created file owns a fixed run of blocks,
/// appended to through the sector-aligned adapter callbacks with
/// read-modify-write on the partial tail sector.
struct FlatFs<BD>
where
    BD: BlockDevice,
{
    adapter: StorageAdapter<BD, NoopLock>,
    names: Vec<String>,
}

impl<BD> FlatFs<BD>
where
    BD: BlockDevice,
{
    fn format(device: BD, num_sectors: u32) -> Self {
        FlatFs {
            adapter: StorageAdapter::new(device, NoopLock, 512, num_sectors),
            names: Vec::new(),
        }
    }
}

impl<BD> Filesystem for FlatFs<BD>
where
    BD: BlockDevice,
{
    type File = FlatFile;
    type Error = AdapterError<BD::Error>;

    fn for_each_name<F>(&mut self, mut f: F) -> Result<(), Self::Error>
    where
        F: FnMut(&str),
    {
        for name in &self.names {
            f(name);
        }
        Ok(())
    }

    fn create(&mut self, name: &str) -> Result<FlatFile, Self::Error> {
        let slot = self.names.len() as u32;
        self.names.push(name.to_string());
        Ok(FlatFile { slot, len: 0 })
    }

    fn append(&mut self, file: &mut FlatFile, data: &[u8]) -> Result<(), Self::Error> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = file.slot * FILE_BLOCKS + file.len / 512;
            let within = (file.len % 512) as usize;
            let take = remaining.len().min(512 - within);
            let mut sector = [0u8; 512];
            if within != 0 {
                self.adapter.read(block, 0, &mut sector)?;
            }
            sector[within..within + take].copy_from_slice(&remaining[..take]);
            self.adapter.prog(block, 0, &sector)?;
            file.len += take as u32;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    fn sync_file(&mut self, _file: &mut FlatFile) -> Result<(), Self::Error> {
        self.adapter.sync()
    }

    fn close(&mut self, _file: FlatFile) -> Result<(), Self::Error> {
        Ok(())
    }

    fn bytes_until_sync_boundary(&self, file: &FlatFile) -> u32 {
        512 - (file.len % 512)
    }
}

struct TickClock {
    now: u64,
}

impl Monotonic for TickClock {
    fn now_micros(&mut self) -> u64 {
        self.now += 10;
        self.now
    }
}

#[derive(Default)]
struct Rotations {
    names: Vec<String>,
}

impl RotationHook for &mut Rotations {
    fn file_rotated(&mut self, name: &str) {
        self.names.push(name.to_string());
    }
}

#[test]
fn ring_to_card_pipeline() {
    init_log();
    let ring: RingLog<1024> = RingLog::new();
    let mut drain = ring.claim_consumer().unwrap();
    let mut memory = vec![0u8; 64 * 512];
    let device = MemoryBlockDevice::new(&mut memory);
    let mut fs = FlatFs::format(device, 64);
    let mut clock = TickClock { now: 0 };
    let mut hooks = Rotations::default();
    let config = ControllerConfig {
        max_file_len: 1024,
        ..ControllerConfig::default()
    };
    let mut controller = LogFileController::new(&mut hooks, config);
    controller.on_mount();

    // Interleave interrupt-side and task-side producers with drain polls,
    // recording the exact byte stream the files must reproduce.
    let mut expected = Vec::new();
    for round in 0..40u8 {
        assert!(ring.append_from_isr(u32::from(round) << 8 | 1));
        expected.push(round);
        let payload = [round; 31];
        assert!(ring.append(0x7E, &payload));
        expected.push(0x7E);
        expected.extend_from_slice(&payload);
        for _ in 0..4 {
            controller.poll(&mut fs, &mut drain, &mut clock);
        }
    }
    assert_eq!(ring.dropped(), 0);

    // 40 rounds of 33 bytes: two full 512-byte cycles filled log_1 to its
    // 1024-byte cap and rotated it; the tail stays buffered.
    let leftover = drain.bytes_available();
    assert_eq!(leftover, 40 * 33 - 1024);
    controller.on_unmount(&mut fs);
    assert_eq!(
        hooks.names,
        vec!["log_1.bin".to_string(), "log_2.bin".to_string()]
    );

    // log_1 occupies slot 0, i.e. the first FILE_BLOCKS sectors.
    drop(fs);
    assert_eq!(&memory[..1024], &expected[..1024]);
}

#[test]
fn sync_failure_spills_into_the_next_file() {
    init_log();
    let ring: RingLog<1024> = RingLog::new();
    let mut drain = ring.claim_consumer().unwrap();
    let mut memory = vec![0u8; 64 * 512];
    let mut device = MemoryBlockDevice::new(&mut memory);
    device.fail_syncs(1);
    let mut fs = FlatFs::format(device, 64);
    let mut clock = TickClock { now: 0 };
    let mut hooks = Rotations::default();
    let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
    controller.on_mount();

    let mut expected = Vec::new();
    for i in 0..16u8 {
        assert!(ring.append(0xA0, &[i; 31]));
        expected.push(0xA0);
        expected.extend_from_slice(&[i; 31]);
    }
    for _ in 0..8 {
        controller.poll(&mut fs, &mut drain, &mut clock);
    }

    // The first sync fault cost log_1 its cycle; the very same ring bytes
    // then landed in log_2, which lives in slot 1.
    assert_eq!(hooks.names, vec!["log_1.bin".to_string()]);
    assert_eq!(drain.bytes_available(), 0);
    drop(fs);
    let slot1 = FILE_BLOCKS as usize * 512;
    assert_eq!(&memory[slot1..slot1 + 512], &expected[..]);
}

#[derive(Default)]
struct Counting {
    online: u32,
    offline: u32,
}

impl HotplugHooks for &mut Counting {
    fn card_online(&mut self, _info: &CardInfo) {
        self.online += 1;
    }
    fn card_offline(&mut self) {
        self.offline += 1;
    }
}

#[test]
fn hotplug_gates_the_storage_path() {
    init_log();
    let mut memory = vec![0u8; 32 * 512];
    let mut counting = Counting::default();
    let device = MemoryBlockDevice::new(&mut memory);
    let mut hotplug = Hotplug::new(device, &mut counting);

    for _ in 0..32 {
        if hotplug.poll() == HotplugState::Operational {
            break;
        }
    }
    assert_eq!(hotplug.state(), HotplugState::Operational);
    let num_sectors = hotplug.card_info().unwrap().num_sectors.0;

    // The adapter composes over the borrowed device while the card is up.
    {
        let device = hotplug.device().unwrap();
        let mut adapter = StorageAdapter::new(device, NoopLock, 512, num_sectors);
        adapter.prog(1, 0, &[0x55u8; 512]).unwrap();
        adapter.sync().unwrap();
    }

    hotplug.device().unwrap().set_present(false);
    hotplug.poll();
    assert_eq!(hotplug.state(), HotplugState::NoCard);
    assert!(hotplug.device().is_none());

    drop(hotplug);
    assert_eq!(memory[512], 0x55);
    assert_eq!(counting.online, 1);
    assert_eq!(counting.offline, 1);
}
