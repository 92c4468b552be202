use std::io::Cursor;

use asg::device::test_utils::{ConsumerEvent, TestHarness};
use asg::device::{
    AbortReason, AddressSpaceGraphicsContext, AsgCommand, AsgCreateInfo, BlockPool,
    ExternalMemory, LoadResources, PingInfo,
};
use asg::device::ring::config_index;
use pretty_assertions::assert_eq;

fn start(ctx: &mut AddressSpaceGraphicsContext) {
    let mut info = PingInfo {
        size: 1,
        ..PingInfo::command(AsgCommand::SetVersion.as_raw())
    };
    ctx.perform(&mut info).unwrap();
}

fn save_all(harness: &TestHarness, contexts: &[AddressSpaceGraphicsContext]) -> Vec<u8> {
    harness.globals.pre_save();
    for ctx in contexts {
        ctx.pre_save();
    }
    let mut bytes = Vec::new();
    harness.globals.save(&mut bytes).unwrap();
    for ctx in contexts {
        ctx.save(&mut bytes).unwrap();
    }
    for ctx in contexts {
        ctx.post_save();
    }
    harness.globals.post_save();
    bytes
}

#[test]
fn contexts_survive_save_and_restore() {
    let source = TestHarness::new();
    let mut contexts: Vec<_> = (0..3)
        .map(|_| {
            AddressSpaceGraphicsContext::new(source.globals.clone(), AsgCreateInfo::default())
                .unwrap()
        })
        .collect();
    start(&mut contexts[0]);
    start(&mut contexts[2]);
    for (i, ctx) in contexts.iter().enumerate() {
        let tag = format!("context {i}");
        ctx.buffer_allocation()
            .host()
            .unwrap()
            .write(0, tag.as_bytes())
            .unwrap();
        ctx.ring().set_config_word(config_index::GUEST_WRITE_POS, 10 + i as u32);
        for _ in 0..=i {
            ctx.on_unavailable_read();
        }
    }
    let saved_handles: Vec<_> = contexts.iter().map(|c| c.consumer()).collect();
    let expected: Vec<_> = contexts
        .iter()
        .map(|c| {
            (
                c.ring_allocation().offset_into_phys,
                c.buffer_allocation().offset_into_phys,
                c.saved_config(),
            )
        })
        .collect();

    let bytes = save_all(&source, &contexts);
    assert_eq!(
        source.consumer.events()[0..2].to_vec(),
        vec![
            ConsumerEvent::Create {
                handle: 1,
                context_id: 0,
                capset_id: 0,
                name: None,
                restored_from: None
            },
            ConsumerEvent::Create {
                handle: 2,
                context_id: 0,
                capset_id: 0,
                name: None,
                restored_from: None
            },
        ]
    );
    assert_eq!(source.consumer.events()[2], ConsumerEvent::GlobalPreSave);
    drop(contexts);

    let target = TestHarness::new();
    let mut r = Cursor::new(bytes);
    target.globals.load(&mut r, None).unwrap();
    let restored: Vec<_> = (0..3)
        .map(|_| AddressSpaceGraphicsContext::load(target.globals.clone(), &mut r).unwrap())
        .collect();
    assert_eq!(r.position() as usize, r.get_ref().len());

    for (i, ctx) in restored.iter().enumerate() {
        let (ring_offset, buffer_offset, saved_config) = expected[i];
        assert_eq!(ctx.ring_allocation().offset_into_phys, ring_offset);
        assert_eq!(ctx.buffer_allocation().offset_into_phys, buffer_offset);
        assert_eq!(ctx.saved_config(), saved_config);
        assert_eq!(ctx.version(), 1);

        let tag = format!("context {i}");
        let mut seen = vec![0u8; tag.len()];
        ctx.buffer_allocation().host().unwrap().read(0, &mut seen).unwrap();
        assert_eq!(seen, tag.as_bytes());
        assert_eq!(
            ctx.ring().config_word(config_index::GUEST_WRITE_POS),
            10 + i as u32
        );
        assert_eq!(ctx.consumer().is_some(), saved_handles[i].is_some());
        assert!(!ctx.is_exiting());
        assert_eq!(ctx.unavailable_read_count(), i as u32 + 1);
    }

    let events = target.consumer.events();
    assert_eq!(events[0], ConsumerEvent::GlobalPreLoad);
    assert!(events.contains(&ConsumerEvent::Create {
        handle: 2,
        context_id: 0,
        capset_id: 0,
        name: None,
        restored_from: Some(saved_handles[2].unwrap().0),
    }));
    assert!(events.contains(&ConsumerEvent::PostLoad(1)));
    assert_eq!(target.consumer.created_count(), 2);

    // Restored blocks are mapped at the same guest physical addresses.
    assert_eq!(target.ops.mapped_gpas(), source_gpas(&expected));

    drop(restored);
    assert_eq!(target.globals.live_block_count(BlockPool::Ring), 0);
    assert_eq!(target.globals.live_block_count(BlockPool::Buffer), 0);
}

fn source_gpas(expected: &[(u64, u64, asg::device::RingConfig)]) -> Vec<u64> {
    // One ring block and one buffer block; their bases are the lowest offsets in each.
    let ring = expected.iter().map(|e| e.0).min().unwrap();
    let buffer = expected.iter().map(|e| e.1).min().unwrap();
    let block = asg::device::test_utils::small_config().block_size;
    let mut gpas = vec![
        TestHarness::WINDOW_BASE + ring / block * block,
        TestHarness::WINDOW_BASE + buffer / block * block,
    ];
    gpas.sort();
    gpas
}

#[test]
fn virtio_context_is_rebuilt_on_replacement_memory() {
    let source = TestHarness::new();
    let external = source.external_memory();
    let mut ctx = AddressSpaceGraphicsContext::new(
        source.globals.clone(),
        source.virtio_create_info(9, Some(external.clone())),
    )
    .unwrap();
    start(&mut ctx);
    ctx.buffer_allocation().host().unwrap().write(0, b"virtio").unwrap();

    let bytes = save_all(&source, std::slice::from_ref(&ctx));
    drop(ctx);

    let target = TestHarness::new();
    let mut resources = LoadResources::default();
    resources
        .context_external_memory
        .insert(9, ExternalMemory::new(external.region().clone()));

    let mut r = Cursor::new(bytes);
    target.globals.load(&mut r, Some(&resources)).unwrap();
    let restored = AddressSpaceGraphicsContext::load(target.globals.clone(), &mut r).unwrap();

    let info = restored.virtio_gpu_info().unwrap();
    assert_eq!(info.context_id, 109);
    assert_eq!(info.name.as_deref(), Some("ctx-9"));
    assert_eq!(restored.combined_allocation().hostmem_id, 0x1009);
    assert!(restored.ring_allocation().is_view);
    assert_eq!(
        restored.buffer_allocation().host().unwrap().as_ptr(),
        external.region().as_ptr().wrapping_add(0x2000)
    );
    let mut seen = [0u8; 6];
    restored.buffer_allocation().host().unwrap().read(0, &mut seen).unwrap();
    assert_eq!(&seen, b"virtio");
    // The restore path republishes the configured sizes.
    assert_eq!(restored.ring().config().buffer_size, 64 * 1024);

    let events = target.consumer.events();
    assert!(events.iter().any(|event| matches!(
        event,
        ConsumerEvent::Create { context_id: 109, capset_id: 3, restored_from: Some(_), .. }
    )));
}

#[test]
fn missing_replacement_memory_is_fatal() {
    let source = TestHarness::new();
    let ctx = AddressSpaceGraphicsContext::new(
        source.globals.clone(),
        source.virtio_create_info(9, Some(source.external_memory())),
    )
    .unwrap();
    let bytes = save_all(&source, std::slice::from_ref(&ctx));
    drop(ctx);

    let target = TestHarness::new();
    let err = target
        .globals
        .load(&mut Cursor::new(&bytes), Some(&LoadResources::default()))
        .unwrap_err();
    assert_eq!(err.fatal_reason(), Some(AbortReason::InternalConsistency));

    let err = target.globals.load(&mut Cursor::new(&bytes), None).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn occupied_fixed_region_is_tolerated_on_load() {
    let source = TestHarness::new();
    let ctx =
        AddressSpaceGraphicsContext::new(source.globals.clone(), AsgCreateInfo::default()).unwrap();
    let ring_block = source.globals.block_info(BlockPool::Ring, 0).unwrap();
    let bytes = save_all(&source, std::slice::from_ref(&ctx));
    drop(ctx);

    let target = TestHarness::new();
    use asg::device::AddressSpaceHwFuncs;
    target
        .hw
        .alloc_shared_host_region_fixed(ring_block.buffer_size, ring_block.offset_into_phys)
        .unwrap();

    let mut r = Cursor::new(bytes);
    target.globals.load(&mut r, None).unwrap();
    let restored = AddressSpaceGraphicsContext::load(target.globals.clone(), &mut r).unwrap();
    assert_eq!(
        restored.ring_allocation().offset_into_phys,
        ring_block.offset_into_phys
    );
}

#[test]
fn truncated_stream_is_recoverable() {
    let source = TestHarness::new();
    let ctx =
        AddressSpaceGraphicsContext::new(source.globals.clone(), AsgCreateInfo::default()).unwrap();
    let mut bytes = Vec::new();
    source.globals.save(&mut bytes).unwrap();
    drop(ctx);

    let target = TestHarness::new();
    target.globals.load(&mut Cursor::new(&bytes), None).unwrap();
    for cut in [0, 7, 24, 40, bytes.len() / 2, bytes.len() - 1] {
        let err = target
            .globals
            .load(&mut Cursor::new(&bytes[..cut]), None)
            .unwrap_err();
        assert!(!err.is_fatal(), "cut at {cut}: {err}");
    }
}

#[test]
fn load_replaces_existing_blocks() {
    let source = TestHarness::new();
    let bytes = save_all(&source, &[]);

    let target = TestHarness::new();
    let ctx =
        AddressSpaceGraphicsContext::new(target.globals.clone(), AsgCreateInfo::default()).unwrap();
    let ring = ctx.ring_allocation().clone();
    let buffer = ctx.buffer_allocation().clone();
    std::mem::forget(ctx);

    target.globals.load(&mut Cursor::new(bytes), None).unwrap();
    assert_eq!(target.globals.block_count(BlockPool::Ring), 0);
    assert_eq!(target.globals.block_count(BlockPool::Buffer), 0);
    assert!(target.ops.mapped_gpas().is_empty());
    assert!(target.hw.allocated_offsets().is_empty());
    drop((ring, buffer));
}
