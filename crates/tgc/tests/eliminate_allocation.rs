//! End-to-end behavior of the eliminate-allocation pipeline.

mod common;

use common::{f32s, no_allocate, pass, AllocationTarget};
use tgc::{Op, Program};

fn alloc(p: &mut Program, lens: &[usize]) -> tgc::InsId {
    p.add_instruction(Op::Allocate { shape: f32s(lens) }, &[])
        .unwrap()
}

fn three_alloc_chain(lens: [&[usize]; 3]) -> Program {
    let mut p = Program::new();
    let a1 = alloc(&mut p, lens[0]);
    let p1 = pass(&mut p, &[a1]);
    let a2 = alloc(&mut p, lens[1]);
    let p2 = pass(&mut p, &[a2, p1]);
    let a3 = alloc(&mut p, lens[2]);
    pass(&mut p, &[a3, p2]);
    p
}

#[test]
fn basic_stacking() {
    let mut p = three_alloc_chain([&[8], &[40], &[200]]);
    p.compile(&AllocationTarget { align: 32 }).unwrap();
    assert_eq!(p.output_shape().unwrap(), f32s(&[200]));
    assert_eq!(p.parameter_shape("memory").unwrap().bytes(), 32 + 160 + 800);
    assert!(no_allocate(&p));
    p.validate().unwrap();
}

#[test]
fn aligned_offsets_pad_small_allocations() {
    let mut p = three_alloc_chain([&[1], &[2], &[200]]);
    p.compile(&AllocationTarget { align: 32 }).unwrap();
    assert_eq!(p.output_shape().unwrap(), f32s(&[200]));
    assert_eq!(p.parameter_shape("memory").unwrap().bytes(), 32 + 32 + 800);
}

#[test]
fn unaligned_packs_tightly() {
    let mut p = three_alloc_chain([&[1], &[2], &[200]]);
    p.compile(&AllocationTarget { align: 1 }).unwrap();
    assert_eq!(p.output_shape().unwrap(), f32s(&[200]));
    assert_eq!(p.parameter_shape("memory").unwrap().bytes(), 4 + 8 + 800);
}

#[test]
fn element_alignment_matches_tight_packing() {
    let mut p = three_alloc_chain([&[1], &[2], &[200]]);
    p.compile(&AllocationTarget { align: 4 }).unwrap();
    assert_eq!(p.parameter_shape("memory").unwrap().bytes(), 4 + 8 + 800);
}

#[test]
fn loads_carry_the_stacked_offsets() {
    let mut p = three_alloc_chain([&[8], &[40], &[200]]);
    p.compile(&AllocationTarget { align: 32 }).unwrap();
    let offsets: Vec<usize> = p
        .iter()
        .filter_map(|id| match p.ins(id).op() {
            Op::Load { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 32, 192]);
}
