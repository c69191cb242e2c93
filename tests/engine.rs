mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::header;
use gantry::engine::{
    AcceptedStream, BufferSizing, EngineContext, FlowError, FrameKind, OpenedStream, StreamIds, FLAG_FIN,
    FLAG_INIT,
};
use gantry::ext::Extension;
use gantry::time::ManualClock;

fn context(clock: &ManualClock) -> EngineContext {
    EngineContext::new(Arc::new(clock.clone()), BufferSizing::default())
}

#[test]
fn reply_data_is_bounded_by_window_and_padding() {
    let clock = ManualClock::new(0);
    let mut ctx = context(&clock);
    let mut net = AcceptedStream::accept(&header(common::NET)).unwrap();
    net.begin(&mut ctx, 0, 0, Extension::None);

    let mut credit = header(common::NET ^ 1);
    credit.maximum = 10;
    net.on_window(&credit, 0, 2).unwrap();
    assert!(net.state.reply_opened());

    let reserved = net.claim_whole(&mut ctx, 8).unwrap();
    assert_eq!(reserved, 10);
    net.data(&mut ctx, 0, FLAG_INIT | FLAG_FIN, reserved, Some(Bytes::from_static(b"12345678")), Extension::None)
        .unwrap();
    assert!(net.claim_whole(&mut ctx, 1).is_none());
    assert!(matches!(
        net.data(&mut ctx, 0, FLAG_INIT | FLAG_FIN, 1, None, Extension::None),
        Err(FlowError::WindowExceeded { .. })
    ));

    let frames = ctx.drain();
    assert_eq!(common::names(&frames), vec!["BEGIN", "DATA"]);
    assert_eq!(frames[1].header.sequence, 0);
}

#[test]
fn shared_budget_defers_claim_until_credited() {
    let clock = ManualClock::new(0);
    let mut ctx = context(&clock);
    ctx.budgets.credit(7, 5);

    let ids = StreamIds::new(1, 2, ctx.supply_initial_id(), 0);
    let mut app = OpenedStream::new(ids);
    app.begin(&mut ctx, 0, 0, Extension::None);
    let mut credit = header(ids.initial_id);
    credit.maximum = 100;
    app.on_window(&credit, 7, 0).unwrap();

    assert!(app.claim_whole(&mut ctx, 8).is_none());
    assert!(ctx.budgets.take_flushable().is_empty());

    ctx.budgets.credit(7, 10);
    assert_eq!(ctx.budgets.take_flushable(), vec![ids.initial_id]);
    assert_eq!(app.claim_whole(&mut ctx, 8), Some(8));
    assert_eq!(ctx.budgets.available(7), Some(7));
}

#[test]
fn partial_claim_splits_large_payloads() {
    let clock = ManualClock::new(0);
    let mut ctx = context(&clock);
    let mut net = AcceptedStream::accept(&header(common::NET)).unwrap();
    let mut credit = header(common::NET ^ 1);
    credit.maximum = 6;
    net.on_window(&credit, 0, 1).unwrap();

    assert_eq!(net.claim_partial(&mut ctx, 20), (5, 6));
    assert_eq!(net.claim_partial(&mut ctx, 0), (0, 0));
}

#[test]
fn window_is_only_sent_when_it_moves() {
    let clock = ManualClock::new(0);
    let mut ctx = context(&clock);
    let mut net = AcceptedStream::accept(&header(common::NET)).unwrap();
    net.window(&mut ctx, 0, 1024);
    net.window(&mut ctx, 0, 1024);
    assert_eq!(ctx.drain().len(), 1);

    net.on_data(&header(common::NET), 100).unwrap();
    net.window(&mut ctx, 0, 1024);
    let frames = ctx.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.acknowledge, 100);

    net.on_end(&common::header_at(common::NET, 100)).unwrap();
    net.window(&mut ctx, 0, 2048);
    assert_eq!(ctx.pending_frames(), 0);
}

#[test]
fn supplied_ids_pair_and_stay_clear_of_host_ids() {
    let clock = ManualClock::new(0);
    let mut ctx = context(&clock);
    let first = ctx.supply_initial_id();
    let second = ctx.supply_initial_id();
    assert!(EngineContext::is_supplied(first));
    assert!(EngineContext::is_supplied(EngineContext::supply_reply_id(first)));
    assert!(!EngineContext::is_supplied(common::NET));
    assert_eq!(first % 2, 1);
    assert_ne!(first, second);

    ctx.bind_pair(first, common::NET);
    assert_eq!(ctx.owner(first ^ 1), Some(common::NET));
    ctx.unbind_pair(first);
    assert_eq!(ctx.owner(first), None);
}

#[test]
fn timers_fire_as_signals_in_deadline_order() {
    let clock = ManualClock::new(1_000);
    let mut ctx = context(&clock);
    let ids = StreamIds::new(1, 2, ctx.supply_initial_id(), 0);
    let app = OpenedStream::new(ids);
    let target = app.signal_target(42);

    let mut late = Some(ctx.signal_at(1_300, target, 2, 0));
    ctx.signal_at(1_100, target, 1, 7);
    assert!(ctx.expire_timers().is_empty());

    clock.advance(150);
    let fired = ctx.expire_timers();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].stream_id(), ids.initial_id);
    assert_eq!(fired[0].header.trace_id, 42);
    assert!(matches!(fired[0].kind, FrameKind::Signal { signal_id: 1, context: 7 }));

    ctx.cancel(&mut late);
    assert!(late.is_none());
    clock.advance(1_000);
    assert!(ctx.expire_timers().is_empty());
    assert_eq!(ctx.timers.pending(), 0);
}
