//! End-to-end compilation tests: record a stream, build the graph, compile,
//! disassemble, and compare against the exact expected instruction sequence.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;

use taskvm_runtime::bytecode::BytecodeError;
use taskvm_runtime::context::{
    Access, ElementKind, ExecutionContext, ObjectDesc, ObjectFlags, TaskDesc,
};
use taskvm_runtime::disasm::{Instruction, disassemble};
use taskvm_runtime::record::GraphRecorder;

use crate::{CompileError, CompileOptions, build_graph, compile, compile_with_options};

/// Honors `RUST_LOG` when a test needs compiler tracing.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two-object, one-task setup: object 0 read, object 1 written and streamed
/// out, everything mapped to device 0.
fn scale_setup(len_bytes: u64) -> (ExecutionContext, Vec<u8>) {
    let mut execution = ExecutionContext::new();
    execution.add_object(ObjectDesc::buffer(len_bytes, ElementKind::F32));
    execution.add_object(
        ObjectDesc::buffer(len_bytes, ElementKind::F32).with_flags(ObjectFlags::STREAM_OUT),
    );
    execution.add_task(TaskDesc::new("scale", [Access::Read, Access::Write]));
    execution.map_task_device(0, 0);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_ref(0)
        .load_ref(1)
        .launch();
    (execution, recorder.finish())
}

/// Two chained tasks: task 0 writes object 1, task 1 reads and rewrites it.
fn chained_setup() -> (ExecutionContext, Vec<u8>) {
    let mut execution = ExecutionContext::new();
    execution.add_object(ObjectDesc::buffer(256, ElementKind::F32));
    execution.add_object(
        ObjectDesc::buffer(256, ElementKind::F32).with_flags(ObjectFlags::STREAM_OUT),
    );
    execution.add_task(TaskDesc::new("produce", [Access::Read, Access::Write]));
    execution.add_task(TaskDesc::new("refine", [Access::Read, Access::Write]));
    execution.map_task_device(0, 0);
    execution.map_task_device(1, 0);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_ref(0)
        .load_ref(1)
        .launch()
        .select_context(1, 1)
        .arg_list_open(2)
        .load_ref(1)
        .load_ref(1)
        .launch();
    (execution, recorder.finish())
}

#[test]
fn single_task_program() {
    init_tracing();
    let (execution, stream) = scale_setup(1024);
    let graph = build_graph(&execution, &stream).unwrap();
    let compiled = compile(&graph, &execution, 0).unwrap();

    let program = disassemble(compiled.bytes()).unwrap();
    assert_eq!(
        program,
        vec![
            Instruction::Setup {
                num_contexts: 1,
                num_tasks: 1,
                num_dep_lists: 1
            },
            Instruction::Context { device_index: 0 },
            Instruction::Begin,
            Instruction::CopyIn {
                object: 0,
                ctx: 0,
                dep: -1
            },
            Instruction::Allocate { object: 1, ctx: 0 },
            Instruction::Launch {
                global_task_id: 0,
                ctx: 0,
                task_index: 0,
                num_args: 2,
                dep: -1
            },
            Instruction::ReferenceArg { index: 0 },
            Instruction::ReferenceArg { index: 1 },
            Instruction::AddDep { dep: 0 },
            Instruction::StreamOutBlocking {
                object: 1,
                ctx: 0,
                dep: 0
            },
            Instruction::End,
        ]
    );
}

#[test]
fn chained_tasks_wait_through_dependency_lists() {
    let (execution, stream) = chained_setup();
    let graph = build_graph(&execution, &stream).unwrap();
    let compiled = compile(&graph, &execution, 0).unwrap();

    let program = disassemble(compiled.bytes()).unwrap();
    assert_eq!(
        program,
        vec![
            Instruction::Setup {
                num_contexts: 1,
                num_tasks: 2,
                num_dep_lists: 2
            },
            Instruction::Context { device_index: 0 },
            Instruction::Begin,
            Instruction::CopyIn {
                object: 0,
                ctx: 0,
                dep: -1
            },
            Instruction::Allocate { object: 1, ctx: 0 },
            Instruction::Launch {
                global_task_id: 0,
                ctx: 0,
                task_index: 0,
                num_args: 2,
                dep: -1
            },
            Instruction::ReferenceArg { index: 0 },
            Instruction::ReferenceArg { index: 1 },
            // The second launch waits on list 0, fed by the first task
            Instruction::AddDep { dep: 0 },
            Instruction::Launch {
                global_task_id: 1,
                ctx: 0,
                task_index: 1,
                num_args: 2,
                dep: 0
            },
            Instruction::ReferenceArg { index: 1 },
            Instruction::ReferenceArg { index: 1 },
            Instruction::AddDep { dep: 1 },
            Instruction::StreamOutBlocking {
                object: 1,
                ctx: 0,
                dep: 1
            },
            Instruction::End,
        ]
    );
}

#[test]
fn batched_program_re_emits_per_chunk() {
    init_tracing();
    let (execution, stream) = scale_setup(4_000_000);
    let graph = build_graph(&execution, &stream).unwrap();
    let compiled = compile_with_options(
        &graph,
        &execution,
        1_500_000,
        CompileOptions {
            max_bytecode_size: 16 * 1024,
        },
    )
    .unwrap();

    let program = disassemble(compiled.bytes()).unwrap();

    let copy_ins: Vec<(i64, i64)> = program
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::CopyInBatch { offset, size, .. } => Some((*offset, *size)),
            _ => None,
        })
        .collect();
    assert_eq!(
        copy_ins,
        vec![(0, 1_500_000), (1_500_000, 1_500_000), (3_000_000, 1_000_000)]
    );
    assert_eq!(copy_ins.iter().map(|(_, size)| size).sum::<i64>(), 4_000_000);

    let launch_threads: Vec<i64> = program
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::LaunchBatch { threads, .. } => Some(*threads),
            _ => None,
        })
        .collect();
    assert_eq!(launch_threads, vec![375_000, 375_000, 250_000]);

    // Only the final stream-out synchronizes the host
    let (blocking, non_blocking): (Vec<&Instruction>, Vec<&Instruction>) = program
        .iter()
        .filter(|instruction| {
            matches!(
                instruction,
                Instruction::StreamOutBatch { .. } | Instruction::StreamOutBlockingBatch { .. }
            )
        })
        .partition(|i| matches!(i, Instruction::StreamOutBlockingBatch { .. }));
    assert_eq!(non_blocking.len(), 2);
    assert_eq!(
        blocking,
        vec![&Instruction::StreamOutBlockingBatch {
            object: 1,
            ctx: 0,
            dep: 0,
            offset: 3_000_000,
            size: 1_000_000
        }]
    );
    assert_eq!(program.last(), Some(&Instruction::End));
}

#[rstest]
#[case::exact_division(1024, 256, 4)]
#[case::uneven_division(1000, 256, 4)]
#[case::oversized_batch(256, 1024, 1)]
fn batch_chunk_counts(#[case] len_bytes: u64, #[case] batch: i64, #[case] expected: usize) {
    let (execution, stream) = scale_setup(len_bytes);
    let graph = build_graph(&execution, &stream).unwrap();
    let compiled = compile(&graph, &execution, batch).unwrap();

    let program = disassemble(compiled.bytes()).unwrap();
    let chunks = program
        .iter()
        .filter(|instruction| matches!(instruction, Instruction::LaunchBatch { .. }))
        .count();
    assert_eq!(chunks, expected);
}

#[test]
fn multi_context_graphs_are_rejected() {
    let mut execution = ExecutionContext::new();
    execution.add_object(ObjectDesc::buffer(256, ElementKind::F32));
    execution.add_object(
        ObjectDesc::buffer(256, ElementKind::F32).with_flags(ObjectFlags::STREAM_OUT),
    );
    execution.add_task(TaskDesc::new("a", [Access::Read, Access::Write]));
    execution.add_task(TaskDesc::new("b", [Access::Read, Access::Write]));
    execution.map_task_device(0, 0);
    execution.map_task_device(1, 1);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_ref(0)
        .load_ref(1)
        .launch()
        .select_context(1, 1)
        .arg_list_open(2)
        .load_ref(1)
        .load_ref(1)
        .launch();

    let graph = build_graph(&execution, recorder.bytes()).unwrap();
    let err = compile(&graph, &execution, 0).unwrap_err();
    assert_matches!(err, CompileError::MultipleContexts { count: 2 });
}

#[test]
fn compilation_is_deterministic() {
    let (execution, stream) = chained_setup();
    let graph = build_graph(&execution, &stream).unwrap();

    let first = compile(&graph, &execution, 0).unwrap();
    let second = compile(&graph, &execution, 0).unwrap();
    assert_eq!(first.bytes(), second.bytes());
}

#[test]
fn programs_without_stream_out_end_with_a_barrier() {
    let mut execution = ExecutionContext::new();
    execution.add_object(ObjectDesc::buffer(256, ElementKind::F32));
    execution.add_object(ObjectDesc::buffer(256, ElementKind::F32));
    execution.add_task(TaskDesc::new("scale", [Access::Read, Access::Write]));
    execution.map_task_device(0, 0);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_ref(0)
        .load_ref(1)
        .launch();

    let graph = build_graph(&execution, recorder.bytes()).unwrap();
    let compiled = compile(&graph, &execution, 0).unwrap();

    let program = disassemble(compiled.bytes()).unwrap();
    assert_eq!(
        &program[program.len() - 2..],
        &[Instruction::Barrier { dep: 0 }, Instruction::End]
    );
    assert!(
        !program
            .iter()
            .any(|i| matches!(i, Instruction::StreamOut { .. }
                | Instruction::StreamOutBlocking { .. }))
    );
}

#[test]
fn constant_arguments_are_encoded_by_slot() {
    let mut execution = ExecutionContext::new();
    let alpha = execution.add_constant(taskvm_runtime::context::Scalar::F32(2.0));
    execution.add_object(
        ObjectDesc::buffer(256, ElementKind::F32).with_flags(ObjectFlags::STREAM_OUT),
    );
    execution.add_task(TaskDesc::new("saxpy", [Access::Read, Access::ReadWrite]));
    execution.map_task_device(0, 0);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_const(alpha)
        .load_ref(0)
        .launch();

    let graph = build_graph(&execution, recorder.bytes()).unwrap();
    let compiled = compile(&graph, &execution, 0).unwrap();

    let program = disassemble(compiled.bytes()).unwrap();
    let launch_at = program
        .iter()
        .position(|i| matches!(i, Instruction::Launch { .. }))
        .unwrap();
    assert_eq!(
        &program[launch_at + 1..launch_at + 3],
        &[
            Instruction::ConstantArg { index: 0 },
            Instruction::ReferenceArg { index: 0 }
        ]
    );
}

#[test]
fn oversized_programs_overflow_the_buffer() {
    let (execution, stream) = scale_setup(1024);
    let graph = build_graph(&execution, &stream).unwrap();

    let err = compile_with_options(
        &graph,
        &execution,
        0,
        CompileOptions {
            max_bytecode_size: 16,
        },
    )
    .unwrap_err();
    assert_matches!(
        err,
        CompileError::Bytecode(BytecodeError::Overflow { capacity: 16 })
    );
}

#[test]
fn batching_rejects_objects_without_descriptors() {
    let mut execution = ExecutionContext::new();
    execution.add_object(ObjectDesc::default());
    execution.add_object(
        ObjectDesc::buffer(1024, ElementKind::F32).with_flags(ObjectFlags::STREAM_OUT),
    );
    execution.add_task(TaskDesc::new("scale", [Access::Read, Access::Write]));
    execution.map_task_device(0, 0);

    let mut recorder = GraphRecorder::new();
    recorder
        .select_context(0, 0)
        .arg_list_open(2)
        .load_ref(0)
        .load_ref(1)
        .launch();

    let graph = build_graph(&execution, recorder.bytes()).unwrap();
    assert_matches!(
        compile(&graph, &execution, 256),
        Err(CompileError::MissingTransferDescriptor { object: 0 })
    );
    // The same graph still compiles unbatched
    assert!(compile(&graph, &execution, 0).is_ok());
}
