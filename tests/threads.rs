mod common;

use common::pattern;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use pretty_assertions::assert_eq;
use sotp::{SharedSotp, Sotp};

const THREADS: u8 = 4;
const TYPES_PER_THREAD: u8 = 4;
const ROUNDS: usize = 100;

fn shared_store(pages: usize) -> SharedSotp<CriticalSectionRawMutex, common::Flash> {
    let mut flash = common::Flash::new(pages);
    flash.verbose = false;

    let sotp = Sotp::new(0, flash.len(), flash).unwrap();
    let sotp = SharedSotp::new(sotp);
    sotp.reset().unwrap();
    sotp
}

#[test]
fn writers_own_their_types() {
    let sotp = shared_store(2);

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let sotp = &sotp;
            scope.spawn(move || {
                let mut buf = [0u8; 64];
                for round in 0..ROUNDS {
                    for i in 0..TYPES_PER_THREAD {
                        let type_ = thread * TYPES_PER_THREAD + i;
                        let value = pattern(round as u8 ^ type_, (round + i as usize) % 64);

                        sotp.set(type_, &value).unwrap();
                        assert_eq!(sotp.get(type_, &mut buf), Ok(value.len()));
                        assert_eq!(&buf[..value.len()], &value[..]);
                    }
                }
            });
        }
    });

    // the area was compacted several times while the threads were writing
    assert!(sotp.statistics().unwrap().version > 0);

    let mut sotp = sotp.into_inner();
    sotp.deinit();
    let mut buf = [0u8; 64];
    let round = ROUNDS - 1;
    for type_ in 0..THREADS * TYPES_PER_THREAD {
        let i = type_ % TYPES_PER_THREAD;
        let value = pattern(round as u8 ^ type_, (round + i as usize) % 64);
        assert_eq!(sotp.get(type_, &mut buf), Ok(value.len()));
        assert_eq!(&buf[..value.len()], &value[..]);
    }
}

#[test]
fn readers_never_see_torn_values() {
    let sotp = shared_store(2);
    let a = pattern(0xA0, 48);
    let b = pattern(0xB0, 40);
    sotp.set(0, &a).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for round in 0..ROUNDS * 4 {
                let value = if round % 2 == 0 { &b } else { &a };
                sotp.set(0, value).unwrap();
                // keep the log growing so that garbage collections interleave with the readers
                sotp.set(1, &pattern(round as u8, 60)).unwrap();
            }
        });

        for _ in 0..2 {
            scope.spawn(|| {
                let mut buf = [0u8; 64];
                for _ in 0..ROUNDS * 4 {
                    let len = sotp.get(0, &mut buf).unwrap();
                    let value = &buf[..len];
                    assert!(value == &a[..] || value == &b[..]);
                }
            });
        }
    });
}
