//! Lower programs to each backend, run them and compare the results.

use mil_ir::lower::{execute, BackendSpec};
use mil_ir::passes::PassManager;
use mil_ir::{
    lower_program, run_compare_builder, tensor_type, Arg, Backend, BuildError, Builder,
    BuilderOptions, CompareOptions, DType, ExpectedDim, ExpectedType, LowerOptions, OpRegistry,
    Program, TensorType, Value, ValueType, VarId,
};
use mil_testing::TestCases;
use rten_tensor::Tensor;

const BACKENDS: [Backend; 2] = [Backend::MilProto, Backend::NnProto];

fn options(backend: Backend) -> CompareOptions {
    CompareOptions {
        backend,
        ..Default::default()
    }
}

fn arange(shape: &[usize]) -> Tensor<i32> {
    let len: usize = shape.iter().product();
    Tensor::from_data(shape, (0..len as i32).collect::<Vec<_>>())
}

/// Evaluate `op` on a constant input at build time.
fn fold_op(op: &str, x: Tensor<f32>, args: &[(&str, Arg)]) -> Value {
    let mut program = Program::new();
    let mut mb = Builder::new(&mut program);
    let mut result = None;
    mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
        let mut builder = mb.op(op).arg("x", x);
        for (name, arg) in args {
            builder = builder.arg(name, arg.clone());
        }
        let out = builder.build1()?;
        result = mb.value(out).cloned();
        Ok(vec![out])
    })
    .unwrap();
    result.unwrap()
}

#[test]
fn test_slice_by_index() {
    for backend in BACKENDS {
        run_compare_builder(
            |mb, x| {
                let out = mb
                    .op("slice_by_index")
                    .arg("x", x[0])
                    .arg("begin", [1, 0, 2])
                    .arg("end", [0, 0, 0])
                    .arg("stride", [1, -1, 1])
                    .arg("begin_mask", vec![false, true, false])
                    .arg("end_mask", vec![false, true, false])
                    .arg("squeeze_mask", vec![true, false, true])
                    .build1()?;
                Ok(vec![out])
            },
            [("x", tensor_type([2, 3, 4], DType::Int32))],
            vec![arange(&[2, 3, 4]).into()],
            &[ExpectedType::new([3], DType::Int32)],
            &[Tensor::from([22, 18, 14]).into()],
            &options(backend),
        )
        .unwrap();
    }
}

#[test]
fn test_reflect_pad() {
    for backend in BACKENDS {
        run_compare_builder(
            |mb, x| {
                let out = mb
                    .op("pad")
                    .arg("x", x[0])
                    .arg("pad", [1, 1, 2, 2])
                    .arg("mode", "reflect")
                    .build1()?;
                Ok(vec![out])
            },
            [("x", tensor_type([2, 3], DType::Fp32))],
            vec![Tensor::from([[1f32, 2., 3.], [4., 5., 6.]]).into()],
            &[ExpectedType::new([4, 7], DType::Fp32)],
            &[Tensor::from([
                [6f32, 5., 4., 5., 6., 5., 4.],
                [3., 2., 1., 2., 3., 2., 1.],
                [6., 5., 4., 5., 6., 5., 4.],
                [3., 2., 1., 2., 3., 2., 1.],
            ])
            .into()],
            &options(backend),
        )
        .unwrap();
    }
}

#[test]
fn test_select_broadcasts() {
    for backend in BACKENDS {
        run_compare_builder(
            |mb, inputs| {
                let out = mb
                    .op("select")
                    .arg("cond", inputs[0])
                    .arg("a", inputs[1])
                    .arg("b", 0f32)
                    .build1()?;
                Ok(vec![out])
            },
            [
                ("cond", tensor_type([3, 1], DType::Bool)),
                ("a", tensor_type([1, 2], DType::Fp32)),
            ],
            vec![
                Tensor::from([[true], [false], [true]]).into(),
                Tensor::from([[1f32, 2.]]).into(),
            ],
            &[ExpectedType::new([3, 2], DType::Fp32)],
            &[Tensor::from([[1f32, 2.], [0., 0.], [1., 2.]]).into()],
            &options(backend),
        )
        .unwrap();
    }
}

#[test]
fn test_real_div_of_ints() {
    for backend in BACKENDS {
        run_compare_builder(
            |mb, inputs| {
                let out = mb
                    .op("real_div")
                    .arg("x", inputs[0])
                    .arg("y", inputs[1])
                    .build1()?;
                Ok(vec![out])
            },
            [
                ("x", tensor_type([2], DType::Int32)),
                ("y", tensor_type([2], DType::Int32)),
            ],
            vec![Tensor::from([5, 6]).into(), Tensor::from([2, 4]).into()],
            &[ExpectedType::new([2], DType::Fp32)],
            &[Tensor::from([2.5f32, 1.5]).into()],
            &options(backend),
        )
        .unwrap();
    }
}

#[test]
fn test_symbolic_input() {
    let batch = mil_ir::Dim::new_symbol();
    let input = tensor_type(vec![batch, mil_ir::Dim::Fixed(3)], DType::Fp32);
    run_compare_builder(
        |mb, x| {
            let out = mb
                .op("reduce_mean")
                .arg("x", x[0])
                .arg("axes", [1])
                .build1()?;
            Ok(vec![out])
        },
        [("x", input)],
        vec![Tensor::from([[1f32, 2., 3.], [4., 5., 6.]]).into()],
        &[ExpectedType::new([ExpectedDim::Any], DType::Fp32)],
        &[Tensor::from([2f32, 5.]).into()],
        &CompareOptions::default(),
    )
    .unwrap();
}

#[test]
fn test_while_loop_over_list() {
    for backend in BACKENDS {
        run_compare_builder(
            |mb, n| {
                let n = n[0];
                let ls = mb
                    .op("make_list")
                    .arg("init_length", 1)
                    .arg("elem_shape", [2])
                    .arg("dtype", "int32")
                    .build1()?;
                let outputs = mb.while_loop(
                    |mb, vars| mb.op("less").arg("x", vars[0]).arg("y", n).build1(),
                    |mb, vars| {
                        let [i, ls] = [vars[0], vars[1]];
                        let doubled = mb.op("mul").arg("x", i).arg("y", 2).build1()?;
                        let row = mb
                            .op("stack")
                            .arg("values", [i, doubled])
                            .arg("axis", 0)
                            .build1()?;
                        let ls = mb
                            .op("list_write")
                            .arg("ls", ls)
                            .arg("index", i)
                            .arg("value", row)
                            .build1()?;
                        let next = mb.op("add").arg("x", i).arg("y", 1).build1()?;
                        Ok(vec![next, ls])
                    },
                    vec![Arg::from(0), Arg::Var(ls)],
                )?;
                let gathered = mb
                    .op("list_gather")
                    .arg("ls", outputs[1])
                    .arg("indices", [0, 1, 2])
                    .build1()?;
                Ok(vec![gathered])
            },
            [("n", TensorType::scalar(DType::Int32))],
            vec![Value::from(3)],
            &[ExpectedType::new([3, 2], DType::Int32)],
            &[Tensor::from([[0, 0], [1, 2], [2, 4]]).into()],
            &options(backend),
        )
        .unwrap();
    }
}

#[test]
fn test_nn_proto_decompositions_match_folding() {
    #[derive(Debug)]
    struct Case {
        op: &'static str,
        args: Vec<(&'static str, Arg)>,
        positive: bool,
    }

    let cases = [
        Case {
            op: "relu6",
            args: vec![],
            positive: false,
        },
        Case {
            op: "clamped_relu",
            args: vec![("alpha", 0.1f32.into()), ("beta", 6f32.into())],
            positive: false,
        },
        Case {
            op: "gelu",
            args: vec![("mode", "TANH_APPROXIMATION".into())],
            positive: false,
        },
        Case {
            op: "gelu",
            args: vec![("mode", "SIGMOID_APPROXIMATION".into())],
            positive: false,
        },
        Case {
            op: "square",
            args: vec![],
            positive: false,
        },
        Case {
            op: "rsqrt",
            args: vec![],
            positive: true,
        },
        Case {
            op: "exp2",
            args: vec![],
            positive: false,
        },
        Case {
            op: "softplus_parametric",
            args: vec![
                ("alpha", vec![1f32, 2.].into()),
                ("beta", vec![0.5f32, 1.].into()),
            ],
            positive: false,
        },
    ];

    cases.test_each(|case| {
        let data = if case.positive {
            vec![0.25f32, 1., 4., 9.]
        } else {
            vec![-7f32, -0.5, 0.5, 7.]
        };
        let x = Tensor::from_data(&[1, 2, 2, 1], data);
        let expected = fold_op(case.op, x.clone(), &case.args);

        let args = case.args.clone();
        let op = case.op;
        run_compare_builder(
            move |mb, inputs| {
                let mut builder = mb.op(op).arg("x", inputs[0]);
                for (name, arg) in args {
                    builder = builder.arg(name, arg);
                }
                Ok(vec![builder.build1()?])
            },
            [("x", tensor_type([1, 2, 2, 1], DType::Fp32))],
            vec![x.into()],
            &[ExpectedType::new([1, 2, 2, 1], DType::Fp32)],
            &[expected],
            &options(Backend::NnProto),
        )
        .unwrap();
    })
}

#[test]
fn test_unsupported_ops_can_be_skipped() {
    let err = run_compare_builder(
        |mb, x| {
            let out = mb
                .op("pad")
                .arg("x", x[0])
                .arg("pad", [1, 0, 0, 0, 0, 0])
                .arg("mode", "reflect")
                .build1()?;
            Ok(vec![out])
        },
        [("x", tensor_type([2, 2, 2], DType::Fp32))],
        vec![Tensor::<f32>::zeros(&[2, 2, 2]).into()],
        &[ExpectedType::new([3, 2, 2], DType::Fp32)],
        &[Tensor::<f32>::zeros(&[3, 2, 2]).into()],
        &options(Backend::NnProto),
    )
    .err()
    .unwrap();
    assert!(err.is_unsupported(), "{}", err);

    // The same program checked only by the frontend passes.
    run_compare_builder(
        |mb, x| {
            let out = mb
                .op("pad")
                .arg("x", x[0])
                .arg("pad", [1, 0, 0, 0, 0, 0])
                .arg("mode", "reflect")
                .build1()?;
            Ok(vec![out])
        },
        [("x", tensor_type([2, 2, 2], DType::Fp32))],
        vec![],
        &[ExpectedType::new([3, 2, 2], DType::Fp32)],
        &[],
        &CompareOptions {
            frontend_only: true,
            ..options(Backend::NnProto)
        },
    )
    .unwrap();
}

fn lower_and_run(program: &Program, backend: Backend, inputs: Vec<Value>) -> Vec<Value> {
    let options = LowerOptions {
        skip_unsupported: false,
    };
    let spec = lower_program(program, backend, &options).unwrap();

    // Specs survive serialization.
    let spec = BackendSpec::from_json(&spec.to_json().unwrap()).unwrap();
    execute(&spec, "main", inputs).unwrap()
}

#[test]
fn test_passes_preserve_outputs() {
    let build = |mb: &mut Builder, x: &[VarId]| -> Result<Vec<VarId>, BuildError> {
        let scale = mb.op("mul").arg("x", 2f32).arg("y", 0.5f32).build1()?;
        let offset = mb.op("fill").arg("shape", [3]).arg("value", 1f32).build1()?;
        let _unused = mb.op("sigmoid").arg("x", x[0]).build1()?;
        let y = mb.op("mul").arg("x", x[0]).arg("y", scale).build1()?;
        let z = mb.op("add").arg("x", y).arg("y", offset).build1()?;
        let w = mb.op("tanh").arg("x", z).build1()?;
        Ok(vec![w])
    };
    let input = Value::from(Tensor::from([-1f32, 0., 2.]));

    let mut program = Program::new();
    Builder::with_options(
        &mut program,
        OpRegistry::global(),
        BuilderOptions { eager_fold: false },
    )
    .function("main", [("x", tensor_type([3], DType::Fp32))], build)
    .unwrap();

    for backend in BACKENDS {
        let before = lower_and_run(&program, backend, vec![input.clone()]);

        let mut optimized = program.clone();
        let stats = PassManager::default_pipeline().run(&mut optimized).unwrap();
        for (name, stats) in &stats {
            match *name {
                // The program has no transposes.
                "reduce_transposes" => assert_eq!(stats.changed, 0),
                _ => assert!(stats.changed > 0, "{} made no changes", name),
            }
        }

        let after = lower_and_run(&optimized, backend, vec![input.clone()]);
        assert_eq!(before, after);

        let expected: Vec<f32> = [0f32, 1., 3.].iter().map(|x| x.tanh()).collect();
        mil_testing::assert_close(&after[0].to_f32_vec().unwrap(), &expected, 1e-6, 0.);
    }
}

#[test]
fn test_transpose_reduction_preserves_outputs() {
    let mut program = Program::new();
    Builder::new(&mut program)
        .function("main", [("x", tensor_type([2, 3, 4], DType::Fp32))], |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [0, 2, 1]).build1()?;
            let y = mb.op("relu").arg("x", t).build1()?;
            let y = mb.op("add").arg("x", y).arg("y", [1f32, 2., 3.]).build1()?;
            let y = mb
                .op("reduce_mean")
                .arg("x", y)
                .arg("axes", [1])
                .arg("keep_dims", true)
                .build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [0, 2, 1]).build1()?;
            Ok(vec![out])
        })
        .unwrap();
    let input = Value::from(Tensor::from_data(
        &[2, 3, 4],
        (0..24).map(|x| x as f32 - 10.).collect::<Vec<_>>(),
    ));

    for backend in BACKENDS {
        let before = lower_and_run(&program, backend, vec![input.clone()]);

        let mut optimized = program.clone();
        let stats = PassManager::default_pipeline().run(&mut optimized).unwrap();
        let (_, reduced) = stats
            .iter()
            .find(|(name, _)| *name == "reduce_transposes")
            .unwrap();
        assert_eq!(reduced.changed, 2);
        assert!(optimized.find_ops(None, Some("transpose")).is_empty());

        let after = lower_and_run(&optimized, backend, vec![input.clone()]);
        assert_eq!(after[0].shape(), [2, 3, 1]);
        mil_testing::assert_close(
            &after[0].to_f32_vec().unwrap(),
            &before[0].to_f32_vec().unwrap(),
            1e-5,
            0.,
        );
    }
}
