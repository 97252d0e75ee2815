use std::cell::RefCell;
use std::rc::Rc;

use crate::base::mem::Fault;
use crate::interconnect::{
    CpuPort, IdealInterconnect, Interconnect, InterconnectConfig, InterfaceId, MemorySlave,
};
use crate::mem::controller::MemoryController;
use crate::mem::physical::PhysicalMemory;
use crate::mem::range::{AddrRange, PhysAddrLayout};
use crate::mem::request::{ExecContext, MemReq, ReqFlags};
use crate::stats::StatsSink;
use crate::timeq::Cycle;

struct Bus {
    stats: StatsSink,
    icn: IdealInterconnect,
    cpus: Vec<(InterfaceId, Rc<RefCell<CpuPort>>)>,
    mem: Rc<RefCell<PhysicalMemory>>,
}

fn bus(num_cpus: usize, latency: Cycle) -> Bus {
    let stats = StatsSink::new();
    let layout = PhysAddrLayout::default();
    let range = AddrRange::new(0x0, 0x10_0000);
    let mem = Rc::new(RefCell::new(
        PhysicalMemory::new("mem0", range, layout, &stats).unwrap(),
    ));
    let mut mc = MemoryController::new("memctrl", 4, layout, &stats).unwrap();
    mc.map(mem.clone(), range).unwrap();
    let config = InterconnectConfig {
        transfer_delay: 5,
        arbitration_delay: 2,
        cpu_count: num_cpus,
        ..Default::default()
    };
    let mut icn = IdealInterconnect::new("membus", config, &stats).unwrap();
    let slave =
        MemorySlave::new("mem_port", Rc::new(RefCell::new(mc)), latency, 0, &stats).unwrap();
    icn.attach(Rc::new(RefCell::new(slave))).unwrap();
    let cpus = (0..num_cpus)
        .map(|i| {
            let port = Rc::new(RefCell::new(
                CpuPort::new(format!("cpu{}", i), i, &stats).unwrap(),
            ));
            (icn.attach(port.clone()).unwrap(), port)
        })
        .collect();
    Bus {
        stats,
        icn,
        cpus,
        mem,
    }
}

fn settle(icn: &mut IdealInterconnect) {
    while let Some(at) = icn.next_event_at() {
        icn.service(at).unwrap();
    }
}

#[test]
fn write_then_read_through_the_bus() {
    let mut b = bus(1, 10);
    let (cpu, port) = b.cpus[0].clone();
    let w = Rc::new(
        MemReq::write(0x2000, 8)
            .with_id(1)
            .with_time(0)
            .with_data(0x1122_3344_5566_7788_u64.to_le_bytes().to_vec()),
    );
    b.icn.send(w, 0, cpu).unwrap();
    settle(&mut b.icn);

    let r = Rc::new(MemReq::read(0x2000, 8).with_id(2).with_time(100));
    b.icn.send(Rc::clone(&r), 100, cpu).unwrap();
    settle(&mut b.icn);

    let mut data = [0u8; 8];
    data.copy_from_slice(&r.data());
    assert_eq!(0x1122_3344_5566_7788, u64::from_le_bytes(data));

    let mut port = port.borrow_mut();
    let first = port.pop_completion().unwrap();
    assert_eq!(1, first.req.id);
    // 7 cycles each way plus the bank latency.
    assert_eq!(24, first.latency());
    let second = port.pop_completion().unwrap();
    assert_eq!(2, second.req.id);
    assert_eq!(124, second.completed);
}

#[test]
fn uncached_alias_routes_to_the_same_bank() {
    let mut b = bus(1, 1);
    b.mem.borrow_mut().poke(0x40, &[0xab; 4]);
    let (cpu, _) = b.cpus[0].clone();
    let r = Rc::new(MemReq::read((1 << 43) | 0x40, 4));
    b.icn.send(Rc::clone(&r), 0, cpu).unwrap();
    settle(&mut b.icn);
    assert_eq!(vec![0xab; 4], *r.data());
    assert_eq!(None, r.fault());
}

#[test]
fn faults_travel_back_with_the_response() {
    let mut b = bus(1, 1);
    let (cpu, port) = b.cpus[0].clone();
    let r = Rc::new(MemReq::read(0x41, 4));
    b.icn.send(Rc::clone(&r), 0, cpu).unwrap();
    settle(&mut b.icn);
    let done = port.borrow_mut().pop_completion().unwrap();
    assert_eq!(Some(Fault::Alignment), done.req.fault());
    assert_eq!(Some(1), b.stats.get("mem_port.faults"));
}

#[test]
fn contended_store_conditionals_have_one_winner() {
    let mut b = bus(2, 4);
    let contexts: Vec<Rc<ExecContext>> = (0..2).map(|i| ExecContext::new(i, i)).collect();
    let lock = 0x800;

    for (i, (cpu, _)) in b.cpus.clone().into_iter().enumerate() {
        let ll = MemReq::read(lock, 8)
            .with_id(i as u64)
            .with_flags(ReqFlags::LOCKED)
            .with_context(&contexts[i]);
        b.icn.send(Rc::new(ll), 0, cpu).unwrap();
    }
    let mut scs = Vec::new();
    for (i, (cpu, _)) in b.cpus.clone().into_iter().enumerate() {
        let sc = Rc::new(
            MemReq::write(lock, 8)
                .with_id(10 + i as u64)
                .with_flags(ReqFlags::LOCKED)
                .with_context(&contexts[i])
                .with_data(vec![i as u8 + 1; 8]),
        );
        b.icn.send(Rc::clone(&sc), 1, cpu).unwrap();
        scs.push(sc);
    }
    settle(&mut b.icn);

    assert_eq!(Some(true), scs[0].sc_result());
    assert_eq!(Some(false), scs[1].sc_result());
    assert_eq!(Some(&[1u8; 8][..]), b.mem.borrow().peek(lock, 8));
    assert!(!contexts[1].lock_flag());
    assert_eq!(1, contexts[1].st_cond_failures());
    assert_eq!(Some(1), b.stats.get("mem0.sc_failures"));
}

#[test]
fn per_cpu_requests_are_counted() {
    let mut b = bus(2, 1);
    let ctx = ExecContext::new(0, 1);
    let (cpu, _) = b.cpus[1].clone();
    for i in 0..3 {
        b.icn
            .send(Rc::new(MemReq::read(0x100 * i, 8).with_context(&ctx)), i, cpu)
            .unwrap();
    }
    settle(&mut b.icn);
    assert_eq!(Some(3), b.stats.get("membus.cpu_requests::cpu1"));
    assert_eq!(Some(6), b.stats.get("membus.deliveries"));
    assert_eq!(0, b.icn.outstanding());
}
