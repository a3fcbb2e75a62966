//! End-to-end lowering tests
//!
//! Each test hand-builds the typed AST the analyzer would produce, runs
//! the generator against fixture metadata and a fake resolver, and asserts
//! on the printed IR and the emitted module structure.

use inkwell::context::Context;
use kscope_compiler::ast::{
    AttachPoint, BinaryOp, Binop, Builtin, Call, Expression, IntegerLit, MapAccess, Probe,
    Program, Statement, StringLit, Variable,
};
use kscope_compiler::codegen::CodeGen;
use kscope_compiler::metadata::{
    MapInfo, ProbeResolver, TraceMetadata, UsdtArg, UsdtInfo, UsdtLocation,
};
use kscope_compiler::types::{AddrSpace, Field, SizedType};
use kscope_compiler::CompileOptions;

#[derive(Default)]
struct FakeResolver {
    matches: Vec<String>,
    usdt: Option<UsdtInfo>,
}

impl ProbeResolver for FakeResolver {
    fn resolve_kname(&self, _name: &str) -> u64 {
        0xffff_ffff_8100_0000
    }

    fn resolve_uname(&self, _name: &str, _target: &str) -> Option<u64> {
        Some(0x40_1000)
    }

    fn resolve_cgroupid(&self, _path: &str) -> u64 {
        42
    }

    fn find_wildcard_matches(&self, _ap: &AttachPoint) -> Vec<String> {
        self.matches.clone()
    }

    fn find_usdt(
        &self,
        _pid: Option<u32>,
        _target: &str,
        _ns: &str,
        _func: &str,
    ) -> Option<UsdtInfo> {
        self.usdt.clone()
    }
}

fn test_metadata() -> TraceMetadata {
    let mut meta = TraceMetadata::new();
    meta.perf_event_map = Some(MapInfo {
        id: 0,
        fd: 3,
        value_type: SizedType::uint32(),
    });
    meta
}

fn register_map(meta: &mut TraceMetadata, ident: &str, value_type: SizedType, id: u64, fd: i32) {
    meta.maps.insert(
        ident.to_string(),
        MapInfo {
            id,
            fd,
            value_type,
        },
    );
}

fn int_lit(value: i64) -> Expression {
    Expression::Integer(IntegerLit {
        value,
        ty: SizedType::int64(),
    })
}

fn str_lit(value: &str, size: u64) -> Expression {
    Expression::String(StringLit {
        value: value.to_string(),
        ty: SizedType::string(size),
    })
}

fn builtin(ident: &str, ty: SizedType) -> Expression {
    Expression::Builtin(Builtin {
        ident: ident.to_string(),
        ty,
        kfarg_index: None,
    })
}

fn binop(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::Binop(Binop {
        op,
        left: Box::new(left),
        right: Box::new(right),
        ty: SizedType::uint64(),
    })
}

fn agg_call(func: &str, map: &MapAccess, args: Vec<Expression>) -> Expression {
    Expression::Call(Call {
        func: func.to_string(),
        map: Some(map.clone()),
        args,
        ty: SizedType::none(),
    })
}

fn call(func: &str, args: Vec<Expression>, ty: SizedType) -> Expression {
    Expression::Call(Call {
        func: func.to_string(),
        map: None,
        args,
        ty,
    })
}

fn kprobe_attach(func: &str) -> AttachPoint {
    let mut ap = AttachPoint::new("kprobe");
    ap.func = func.to_string();
    ap
}

fn kprobe_probe(func: &str, pred: Option<Expression>, stmts: Vec<Statement>) -> Probe {
    Probe {
        pred,
        stmts,
        attach_points: vec![kprobe_attach(func)],
        need_expansion: false,
    }
}

fn lower(program: &Program, meta: &mut TraceMetadata, resolver: &FakeResolver) -> String {
    let context = Context::create();
    let mut codegen = CodeGen::new(
        &context,
        "test",
        meta,
        resolver,
        CompileOptions::default(),
    )
    .expect("codegen init");
    codegen.generate(program).expect("lowering failed");
    codegen.print_ir()
}

/// `kprobe:do_nanosleep { @[comm] = count(); }`
fn count_by_comm_program() -> Program {
    let map = MapAccess {
        ident: "counts".to_string(),
        keys: vec![builtin("comm", SizedType::string(16))],
        ty: SizedType::uint64(),
    };
    Program {
        probes: vec![kprobe_probe(
            "do_nanosleep",
            None,
            vec![Statement::AssignMap {
                map: map.clone(),
                expr: agg_call("count", &map, vec![]),
            }],
        )],
    }
}

#[test]
fn test_count_by_comm() {
    let mut meta = test_metadata();
    register_map(&mut meta, "counts", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let ir = lower(&count_by_comm_program(), &mut meta, &resolver);

    assert!(ir.contains("section \"s_kprobe:do_nanosleep_1\""));
    // comm goes through bpf_get_current_comm (helper 16)
    assert!(ir.contains("inttoptr (i64 16 to ptr)"));
    // read-modify-write: lookup (1) then update (2)
    assert!(ir.contains("inttoptr (i64 1 to ptr)"));
    assert!(ir.contains("inttoptr (i64 2 to ptr)"));
    // missing slots read as zero before the increment
    assert!(ir.contains("lookup_failure"));
}

#[test]
fn test_lifetime_balance_for_count_program() {
    let mut meta = test_metadata();
    register_map(&mut meta, "counts", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let ir = lower(&count_by_comm_program(), &mut meta, &resolver);

    let starts = ir.matches("llvm.lifetime.start").count();
    let ends = ir.matches("llvm.lifetime.end").count();
    // declarations add one occurrence each
    assert_eq!(starts, ends, "unbalanced stack lifetimes:\n{ir}");
}

/// `kprobe:f { @h = hist(arg0); }`
#[test]
fn test_hist_emits_log2_helper() {
    let mut meta = test_metadata();
    register_map(&mut meta, "h", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let map = MapAccess {
        ident: "h".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let program = Program {
        probes: vec![kprobe_probe(
            "f",
            None,
            vec![Statement::AssignMap {
                map: map.clone(),
                expr: agg_call("hist", &map, vec![builtin("arg0", SizedType::uint64())]),
            }],
        )],
    };
    let ir = lower(&program, &mut meta, &resolver);

    assert!(ir.contains("define internal i64 @log2"));
    assert!(ir.contains("section \"helpers\""));
    assert!(ir.contains("alwaysinline"));
    // five unrolled binary-search steps end at the 2^(2^0) threshold
    assert!(ir.contains("i64 65536"));
}

/// `kprobe:f { if (pid == 42) { printf("hi %d\n", tid); } }`
#[test]
fn test_printf_record_and_arg_offsets() {
    let mut meta = test_metadata();
    meta.printf_args.push((
        "hi %d\n".to_string(),
        vec![Field {
            name: String::new(),
            ty: SizedType::int64(),
            offset: 0,
            bitfield: None,
        }],
    ));
    let resolver = FakeResolver::default();
    let program = Program {
        probes: vec![kprobe_probe(
            "f",
            None,
            vec![Statement::If {
                cond: binop(
                    BinaryOp::Eq,
                    builtin("pid", SizedType::uint64()),
                    int_lit(42),
                ),
                stmts: vec![Statement::Expr(call(
                    "printf",
                    vec![
                        str_lit("hi %d\n", 64),
                        builtin("tid", SizedType::uint64()),
                    ],
                    SizedType::none(),
                ))],
                else_stmts: None,
            }],
        )],
    };
    let ir = lower(&program, &mut meta, &resolver);

    // printf ids start at the action base (0)
    assert!(ir.contains("store i64 0, ptr %action_id"));
    assert!(ir.contains("if_body"));
    // perf_event_output is helper 25
    assert!(ir.contains("inttoptr (i64 25 to ptr)"));
    // the argument table learned the record offset behind the id word
    assert_eq!(meta.printf_args[0].1[0].offset, 8);
}

/// `uprobe:/bin/sh:readline { $s = str(arg0); if ($s == "exit") { exit(); } }`
#[test]
fn test_str_literal_compare_and_exit() {
    let mut meta = test_metadata();
    let resolver = FakeResolver::default();
    let mut ap = AttachPoint::new("uprobe");
    ap.target = "/bin/sh".to_string();
    ap.func = "readline".to_string();

    let arg0 = builtin(
        "arg0",
        SizedType::uint64().with_addr_space(AddrSpace::User),
    );
    let s_var = Variable {
        ident: "s".to_string(),
        ty: SizedType::string(64),
    };
    let program = Program {
        probes: vec![Probe {
            pred: None,
            stmts: vec![
                Statement::AssignVar {
                    var: s_var.clone(),
                    expr: call("str", vec![arg0], SizedType::string(64)),
                },
                Statement::If {
                    cond: binop(
                        BinaryOp::Eq,
                        Expression::Variable(s_var),
                        str_lit("exit", 64),
                    ),
                    stmts: vec![Statement::Expr(call("exit", vec![], SizedType::none()))],
                    else_stmts: None,
                },
            ],
            attach_points: vec![ap],
            need_expansion: false,
        }],
    };
    let ir = lower(&program, &mut meta, &resolver);

    assert!(ir.contains("section \"s_uprobe:/bin/sh:readline_1\""));
    // probe_read_user_str is helper 114
    assert!(ir.contains("inttoptr (i64 114 to ptr)"));
    // the literal is inlined into the compare chain, never stored
    assert!(ir.contains("strcmp.char"));
    assert!(!ir.contains("c\"exit"));
    // exit() returns immediately and parks the rest in a dead block
    assert!(ir.contains("deadcode"));
}

/// `usdt:libfoo:probe1 { @ = count(); }` with two binary locations
#[test]
fn test_usdt_location_fanout() {
    let mut meta = test_metadata();
    register_map(&mut meta, "c", SizedType::uint64(), 1, 4);
    let location = UsdtLocation {
        args: vec![UsdtArg::Register("di".to_string())],
    };
    let resolver = FakeResolver {
        matches: vec!["libfoo:probe1".to_string()],
        usdt: Some(UsdtInfo {
            num_locations: 2,
            locations: vec![location.clone(), location],
        }),
    };

    let map = MapAccess {
        ident: "c".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let mut ap = AttachPoint::new("usdt");
    ap.target = "libfoo".to_string();
    ap.func = "probe1".to_string();
    let program = Program {
        probes: vec![Probe {
            pred: None,
            stmts: vec![Statement::AssignMap {
                map: map.clone(),
                expr: agg_call("count", &map, vec![]),
            }],
            attach_points: vec![ap],
            need_expansion: false,
        }],
    };
    let ir = lower(&program, &mut meta, &resolver);

    assert!(ir.contains("section \"s_usdt:libfoo:probe1_loc0_1\""));
    assert!(ir.contains("section \"s_usdt:libfoo:probe1_loc1_2\""));
}

/// `BEGIN { @start = nsecs; } kprobe:f { $d = nsecs - @start; @lat = hist($d); }`
#[test]
fn test_begin_stamp_and_latency_hist() {
    let mut meta = test_metadata();
    register_map(&mut meta, "start", SizedType::uint64(), 1, 4);
    register_map(&mut meta, "lat", SizedType::uint64(), 2, 5);
    let resolver = FakeResolver::default();

    let start_map = MapAccess {
        ident: "start".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let lat_map = MapAccess {
        ident: "lat".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let d_var = Variable {
        ident: "d".to_string(),
        ty: SizedType::uint64(),
    };

    let begin = Probe {
        pred: None,
        stmts: vec![Statement::AssignMap {
            map: start_map.clone(),
            expr: builtin("nsecs", SizedType::uint64()),
        }],
        attach_points: vec![AttachPoint::new("BEGIN")],
        need_expansion: false,
    };
    let kprobe = kprobe_probe(
        "f",
        None,
        vec![
            Statement::AssignVar {
                var: d_var.clone(),
                expr: binop(
                    BinaryOp::Sub,
                    builtin("nsecs", SizedType::uint64()),
                    Expression::Map(start_map),
                ),
            },
            Statement::AssignMap {
                map: lat_map.clone(),
                expr: agg_call("hist", &lat_map, vec![Expression::Variable(d_var)]),
            },
        ],
    );
    let ir = lower(
        &Program {
            probes: vec![begin, kprobe],
        },
        &mut meta,
        &resolver,
    );

    assert!(ir.contains("section \"s_BEGIN_1\""));
    assert!(ir.contains("section \"s_kprobe:f_1\""));
    // ktime_get_ns is helper 5
    assert!(ir.contains("inttoptr (i64 5 to ptr)"));
    assert!(ir.contains("define internal i64 @log2"));
}

#[test]
fn test_determinism() {
    let resolver = FakeResolver::default();
    let program = count_by_comm_program();

    let mut meta_a = test_metadata();
    register_map(&mut meta_a, "counts", SizedType::uint64(), 1, 4);
    let first = lower(&program, &mut meta_a, &resolver);

    let mut meta_b = test_metadata();
    register_map(&mut meta_b, "counts", SizedType::uint64(), 1, 4);
    let second = lower(&program, &mut meta_b, &resolver);

    assert_eq!(first, second);
}

#[test]
fn test_short_circuit_blocks() {
    let mut meta = test_metadata();
    let resolver = FakeResolver::default();
    let program = Program {
        probes: vec![kprobe_probe(
            "f",
            Some(binop(
                BinaryOp::Land,
                binop(BinaryOp::Eq, builtin("pid", SizedType::uint64()), int_lit(1)),
                binop(BinaryOp::Eq, builtin("tid", SizedType::uint64()), int_lit(2)),
            )),
            vec![],
        )],
    };
    let ir = lower(&program, &mut meta, &resolver);

    // rhs evaluation is gated behind the lhs-true edge
    for block in ["&&_lhs_true", "&&_true", "&&_false", "&&_merge", "pred_false"] {
        assert!(ir.contains(block), "missing block {block}:\n{ir}");
    }
}

#[test]
fn test_min_stores_inverted_value() {
    let mut meta = test_metadata();
    register_map(&mut meta, "m", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let map = MapAccess {
        ident: "m".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let program = Program {
        probes: vec![kprobe_probe(
            "f",
            None,
            vec![Statement::AssignMap {
                map: map.clone(),
                expr: agg_call("min", &map, vec![builtin("arg0", SizedType::uint64())]),
            }],
        )],
    };
    let ir = lower(&program, &mut meta, &resolver);

    // 0xffffffff - v, updated only on signed-ge
    assert!(ir.contains("sub i64 4294967295"));
    assert!(ir.contains("min.ge"));
    assert!(ir.contains("min.merge"));
    assert!(ir.contains("icmp sge"));
}

#[test]
fn test_wildcard_matches_reset_ids() {
    let mut meta = test_metadata();
    meta.printf_args.push((
        "x\n".to_string(),
        vec![],
    ));
    let resolver = FakeResolver {
        matches: vec!["f1".to_string(), "f2".to_string()],
        usdt: None,
    };
    let program = Program {
        probes: vec![Probe {
            pred: None,
            stmts: vec![Statement::Expr(call(
                "printf",
                vec![str_lit("x\n", 64)],
                SizedType::none(),
            ))],
            attach_points: vec![kprobe_attach("f*")],
            need_expansion: true,
        }],
    };
    let ir = lower(&program, &mut meta, &resolver);

    assert!(ir.contains("section \"s_kprobe:f1_1\""));
    assert!(ir.contains("section \"s_kprobe:f2_2\""));
    // both programs start from the snapshot baseline: id 0 twice, never 1
    assert_eq!(ir.matches("store i64 0, ptr %action_id").count(), 2);
    assert!(!ir.contains("store i64 1, ptr %action_id"));
}

#[test]
fn test_volatile_context_loads() {
    let mut meta = test_metadata();
    register_map(&mut meta, "m", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let map = MapAccess {
        ident: "m".to_string(),
        keys: vec![],
        ty: SizedType::uint64(),
    };
    let program = Program {
        probes: vec![kprobe_probe(
            "f",
            None,
            vec![Statement::AssignMap {
                map,
                expr: builtin("arg0", SizedType::uint64()),
            }],
        )],
    };
    let ir = lower(&program, &mut meta, &resolver);

    assert!(ir.contains("load volatile i64"));
}

#[test]
fn test_emitted_module_is_valid_object() {
    let mut meta = test_metadata();
    register_map(&mut meta, "counts", SizedType::uint64(), 1, 4);
    let resolver = FakeResolver::default();
    let program = count_by_comm_program();

    let context = Context::create();
    let mut codegen = CodeGen::new(
        &context,
        "test",
        &mut meta,
        &resolver,
        CompileOptions::default(),
    )
    .expect("codegen init");
    codegen.generate(&program).expect("lowering failed");
    codegen.optimize().expect("optimization failed");
    let object = codegen.emit().expect("object emission failed");
    // ELF magic
    assert_eq!(&object[..4], b"\x7fELF");
}
