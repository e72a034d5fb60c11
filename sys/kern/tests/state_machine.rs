// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread-table state machine: allocation, suspension, cross-CPU
//! resumption, exhaustion, the boot thread, mutex accounting, and the
//! exception-mask laws.

mod common;

use citadel_abi::{self as abi, SmcArgs};
use citadel_kern::config::Config;
use citadel_kern::exceptions::ExceptionMask;
use citadel_kern::kmutex::KMutex;
use citadel_kern::platform::host::{self, HostPlatform};
use citadel_kern::platform::{Handlers, Platform};
use citadel_kern::thread::{ThreadFlags, ThreadState};
use citadel_kern::ThreadCore;
use common::*;
use std::sync::Mutex;

const CLIENT: u64 = 0x51de_0001;

#[test]
fn suspension_publishes_context_and_clears_cpu() {
    let h = harness(Config::default());
    let ns = NormalWorld::new(&h.core, CLIENT);

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);

    // Dispatch by hand and stop at the first suspension.
    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);

    assert_eq!(args.a0, abi::RETURN_RPC_ALLOC);
    let slot = args.a3 as usize;
    assert_eq!(h.core.thread_state(slot), ThreadState::Suspended);
    assert_eq!(h.core.core_local_of(0).curr_thread(), None);
    assert_eq!(h.core.thread_client_id(slot), CLIENT);

    // The saved context is a real kernel context.
    let regs = h.core.thread_regs(slot);
    assert_eq!(regs.pc, host::STD_SMC_ENTRY_PC);
    assert_ne!(regs.spsr, 0);
    assert_eq!(regs.x[0], abi::CALL_WITH_ARG);

    // Drive it home.
    let reply = ns.pump(args);
    assert_eq!(reply.a0, abi::RETURN_OK);
    assert_eq!(h.core.thread_state(slot), ThreadState::Free);
}

#[test]
fn resume_on_other_cpu_moves_current_thread() {
    static OBSERVED: Mutex<Vec<(usize, Option<usize>)>> = Mutex::new(Vec::new());

    fn observing_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        OBSERVED
            .lock()
            .unwrap()
            .push((host::current_cpu(), core.curr_thread_id_may_fail()));
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: observing_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);

    // Suspend on CPU 0 (the argument-buffer allocation RPC).
    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);
    assert_eq!(args.a0, abi::RETURN_RPC_ALLOC);
    let slot = args.a3 as usize;
    assert_eq!(h.core.core_local_of(0).curr_thread(), None);

    // Resume on CPU 1 and run to completion there.
    ns.resume_cpu.set(1);
    let reply = ns.pump(args);
    assert_eq!(reply.a0, abi::RETURN_OK);

    // The handler ran on CPU 1 with the slot as its current thread.
    let observed = OBSERVED.lock().unwrap();
    assert_eq!(*observed, vec![(1, Some(slot))]);
    assert_eq!(h.core.core_local_of(0).curr_thread(), None);
    assert_eq!(h.core.core_local_of(1).curr_thread(), None);
    assert_eq!(h.core.thread_state(slot), ThreadState::Free);
}

#[test]
fn resume_mismatches_reply_eresume() {
    let h = harness(Config::default());
    h.core.platform().monitor_entry(0);

    // Resuming a FREE slot.
    let mut args = SmcArgs {
        a0: abi::CALL_RETURN_FROM_RPC,
        a3: 0,
        a7: CLIENT,
        ..SmcArgs::default()
    };
    h.core.handle_std_smc(&mut args);
    assert_eq!(args.a0, abi::RETURN_ERESUME);
    assert_eq!(h.core.thread_state(0), ThreadState::Free);

    // Resuming a slot index past the pool.
    let mut args = SmcArgs {
        a0: abi::CALL_RETURN_FROM_RPC,
        a3: 99,
        a7: CLIENT,
        ..SmcArgs::default()
    };
    h.core.handle_std_smc(&mut args);
    assert_eq!(args.a0, abi::RETURN_ERESUME);

    // A real suspension, but the wrong caller identity.
    let ns = NormalWorld::new(&h.core, CLIENT);
    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);
    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);
    let slot = args.a3 as usize;
    assert_eq!(h.core.thread_state(slot), ThreadState::Suspended);

    let mut bad = ns.service_rpc(&args);
    bad.a7 = CLIENT ^ 1;
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut bad);
    assert_eq!(bad.a0, abi::RETURN_ERESUME);
    assert_eq!(h.core.thread_state(slot), ThreadState::Suspended);

    // The correct identity still works afterwards.
    let mut good = ns.service_rpc(&args);
    good.a7 = CLIENT;
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut good);
    let reply = ns.pump(good);
    assert_eq!(reply.a0, abi::RETURN_OK);
}

#[test]
fn pool_exhaustion_replies_ethread_limit() {
    let mut config = Config::default();
    config.num_threads = 2;
    let h = harness(config);

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);

    // Park both slots in their first RPC.
    for expected_slot in 0..2 {
        let mut args = call_with_arg(CLIENT);
        h.core.platform().monitor_entry(0);
        h.core.handle_std_smc(&mut args);
        assert_eq!(args.a0, abi::RETURN_RPC_ALLOC);
        assert_eq!(args.a3 as usize, expected_slot);
    }

    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);
    assert_eq!(args.a0, abi::RETURN_ETHREAD_LIMIT);
    // Nothing changed: both slots still suspended, none current.
    assert_eq!(h.core.thread_state(0), ThreadState::Suspended);
    assert_eq!(h.core.thread_state(1), ThreadState::Suspended);
    assert_eq!(h.core.core_local_of(0).curr_thread(), None);
}

#[test]
fn at_most_min_cores_threads_active() {
    let mut config = Config::default();
    config.num_threads = 3;
    config.num_cores = 2;

    static GATE: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn counting_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        let active = (0..core.config().num_threads)
            .filter(|n| core.thread_state(*n) == ThreadState::Active)
            .count();
        GATE.lock().unwrap().push(active);
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        config,
        Some(Handlers {
            std_smc: counting_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);

    let ns = NormalWorld::new(&h.core, CLIENT);
    for cpu in 0..2 {
        let reply = ns.call(cpu, call_with_arg(CLIENT));
        assert_eq!(reply.a0, abi::RETURN_OK);
    }

    // Sequential calls: never more than min(cores, threads) active.
    for active in GATE.lock().unwrap().iter() {
        assert!(*active <= 2);
    }
}

#[test]
fn boot_thread_claim_and_release() {
    let h = harness(Config::default());
    h.core.platform().monitor_entry(1);

    h.core.init_boot_thread();
    assert_eq!(h.core.thread_state(0), ThreadState::Active);
    assert_eq!(h.core.core_local_of(1).curr_thread(), Some(0));

    h.core.clr_boot_thread();
    assert_eq!(h.core.thread_state(0), ThreadState::Free);
    assert_eq!(h.core.core_local_of(1).curr_thread(), None);
}

#[test]
#[should_panic(expected = "holding mutexes")]
fn exiting_with_held_mutex_is_fatal() {
    static LEAKED: Mutex<Option<KMutex>> = Mutex::new(None);
    *LEAKED.lock().unwrap() = Some(KMutex::new());

    fn leaky_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        let prev = core.mask_exceptions(ExceptionMask::IRQ);
        let guard = LEAKED.lock().unwrap();
        core.add_mutex(guard.as_ref().unwrap());
        core.unmask_exceptions(prev);
        // Return without releasing: the thread-exit path must refuse.
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: leaky_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);
    ns.call(0, call_with_arg(CLIENT));
}

#[test]
fn mutex_accounting_tracks_owner_and_list() {
    static HELD: Mutex<Option<KMutex>> = Mutex::new(None);
    *HELD.lock().unwrap() = Some(KMutex::new());

    fn balanced_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        let prev = core.mask_exceptions(ExceptionMask::IRQ);
        let guard = HELD.lock().unwrap();
        let m = guard.as_ref().unwrap();

        let ct = core.current_thread_id();
        core.add_mutex(m);
        assert_eq!(m.owner(), Some(ct));
        assert_eq!(core.held_mutexes(ct), 1);

        core.rem_mutex(m);
        assert_eq!(m.owner(), None);
        assert_eq!(core.held_mutexes(ct), 0);

        core.unmask_exceptions(prev);
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: balanced_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);
    let reply = ns.call(0, call_with_arg(CLIENT));
    assert_eq!(reply.a0, abi::RETURN_OK);
}

#[test]
fn foreign_interrupt_suspends_without_arg_copy() {
    fn intr_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        core.rpc_foreign_intr();
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: intr_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);

    // Walk to the foreign-interrupt suspension by hand: first the
    // argument-buffer RPC, then the interrupt.
    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);
    assert_eq!(args.a0, abi::RETURN_RPC_ALLOC);
    let mut resume = ns.service_rpc(&args);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut resume);

    assert_eq!(resume.a0, abi::RETURN_RPC_FOREIGN_INTR);
    let slot = resume.a3 as usize;
    assert!(h
        .core
        .thread_flags(slot)
        .contains(ThreadFlags::EXIT_ON_FOREIGN_INTR));
    let saved = h.core.thread_regs(slot);

    // Resume with garbage argument words; without the copy flag they must
    // not reach the saved registers.
    let mut back = SmcArgs {
        a0: abi::CALL_RETURN_FROM_RPC,
        a1: 0xdead,
        a2: 0xbeef,
        a3: slot as u64,
        a4: 0xf00d,
        a5: 0xcafe,
        a7: CLIENT,
        ..SmcArgs::default()
    };
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut back);
    let reply = ns.pump(back);
    assert_eq!(reply.a0, abi::RETURN_OK);

    assert_eq!(ns.foreign_intrs.get(), 1);
    // The pre-resume snapshot kept the thread's own words.
    assert_eq!(saved.x[0], abi::CALL_WITH_ARG);
    assert!(!h
        .core
        .thread_flags(slot)
        .contains(ThreadFlags::EXIT_ON_FOREIGN_INTR));
}

#[test]
fn mask_round_trip_restores_exactly() {
    let h = harness(Config::default());
    h.core.platform().monitor_entry(0);

    for bits in 0..8u32 {
        let start = ExceptionMask::from_bits_truncate(bits)
            | ExceptionMask::IRQ;
        h.core.set_exceptions(start);

        let prev = h.core.mask_exceptions(ExceptionMask::ALL);
        assert_eq!(prev, start);
        assert_eq!(h.core.get_exceptions(), ExceptionMask::ALL);

        h.core.unmask_exceptions(prev);
        assert_eq!(h.core.get_exceptions(), start);
    }
}

#[test]
fn set_irq_and_restore_irq_follow_the_flag() {
    fn irq_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        // std_entry is bypassed here, so enable IRQs ourselves.
        core.set_irq(true);
        assert!(!core.get_exceptions().contains(ExceptionMask::IRQ));

        // Something masks IRQs behind our back; restore brings them up
        // because the flag says so.
        core.mask_exceptions(ExceptionMask::IRQ);
        core.restore_irq();
        assert!(!core.get_exceptions().contains(ExceptionMask::IRQ));

        // Disabling records and masks; restore now leaves them masked.
        core.set_irq(false);
        assert!(core.get_exceptions().contains(ExceptionMask::IRQ));
        core.restore_irq();
        assert!(core.get_exceptions().contains(ExceptionMask::IRQ));

        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: irq_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);
    let reply = ns.call(0, call_with_arg(CLIENT));
    assert_eq!(reply.a0, abi::RETURN_OK);
}

#[test]
fn canaries_survive_dispatch() {
    let h = harness(Config::default());
    let ns = NormalWorld::new(&h.core, CLIENT);

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);
    let reply = ns.call(0, call_with_arg(CLIENT));
    assert_eq!(reply.a0, abi::RETURN_OK);

    // Must not panic.
    h.core.check_canaries();
}

#[test]
fn pager_backed_stacks_release_on_suspend_and_free() {
    use citadel_kern::platform::host::PagerEvent;

    let mut config = Config::default();
    config.pager = true;
    let h = harness(config);
    let ns = NormalWorld::new(&h.core, CLIENT);

    let maps = h
        .core
        .platform()
        .pager_events()
        .iter()
        .filter(|e| matches!(e, PagerEvent::MapStack { .. }))
        .count();
    assert_eq!(maps, h.core.config().num_threads);

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);
    let reply = ns.call(0, call_with_arg(CLIENT));
    assert_eq!(reply.a0, abi::RETURN_OK);

    let releases = h
        .core
        .platform()
        .pager_events()
        .iter()
        .filter(|e| matches!(e, PagerEvent::Release { .. }))
        .count();
    // At least one release per suspension plus the final free.
    assert!(releases >= 3);
}

#[test]
fn user_mode_entry_reaches_the_platform() {
    fn user_std(core: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
        let exit =
            core.enter_user_mode(1, 2, 3, 4, 0x8000_2000, 0x4001, true);
        assert_eq!(exit.exit_status0, 0);
        args.a0 = abi::RETURN_OK;
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            std_smc: user_std,
            ..Handlers::with_defaults(fast_noop)
        }),
    );
    let ns = NormalWorld::new(&h.core, CLIENT);
    let reply = ns.call(0, call_with_arg(CLIENT));
    assert_eq!(reply.a0, abi::RETURN_OK);

    let entries = h.core.platform().user_mode_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_sp, 0x8000_2000);
    assert_eq!(entries[0].entry_func, 0x4001);
    // 32-bit Thumb entry: execution-state and Thumb bits are set.
    assert_ne!(entries[0].spsr & (1 << 4), 0);
    assert_ne!(entries[0].spsr & (1 << 5), 0);
}

#[test]
fn suspended_user_context_captures_the_address_space() {
    use citadel_kern::thread::UserMap;

    let h = harness(Config::default());
    let ns = NormalWorld::new(&h.core, CLIENT);

    let (header, params) = open_session_record(&[]);
    write_arg_record(h.core.platform(), CALLER_ARG_PA, &header, &params);

    // Pretend a trusted application mapping is live on CPU 0; the first
    // suspension must capture and clear it.
    let map = UserMap {
        ttbr0: 0xdead_b000,
        asid: 7,
    };
    h.core.platform().install_user_map(0, map);

    let mut args = call_with_arg(CLIENT);
    h.core.platform().monitor_entry(0);
    h.core.handle_std_smc(&mut args);
    let slot = args.a3 as usize;

    assert!(h.core.thread_has_user_map(slot));
    assert!(!h.core.platform().user_map_active());

    let reply = ns.pump(args);
    assert_eq!(reply.a0, abi::RETURN_OK);
}

#[test]
fn pm_handlers_are_reachable() {
    fn pm_probe(a0: u64, a1: u64) -> u32 {
        (a0 + a1) as u32
    }

    let h = harness_with(
        Config::default(),
        Some(Handlers {
            cpu_on: pm_probe,
            cpu_off: pm_probe,
            cpu_suspend: pm_probe,
            cpu_resume: pm_probe,
            system_off: pm_probe,
            system_reset: pm_probe,
            ..Handlers::with_defaults(fast_noop)
        }),
    );

    assert_eq!(h.core.handle_cpu_on(1, 2), 3);
    assert_eq!(h.core.handle_cpu_off(2, 2), 4);
    assert_eq!(h.core.handle_cpu_suspend(3, 2), 5);
    assert_eq!(h.core.handle_cpu_resume(4, 2), 6);
    assert_eq!(h.core.handle_system_off(5, 2), 7);
    assert_eq!(h.core.handle_system_reset(6, 2), 8);
}
