//! Microbenchmarks for the hot substitution-engine passes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spikegen_codegen::text::{ensure_ftype, function_substitute};
use spikegen_model::ScalarPrecision;

const SIM_CODE: &str = "\
$(V) += ((-$(V) + $(Isyn)) / 20.0) * 1.0;\n\
if ($(V) > -50.0) { $(V) = -60.0; }\n\
scalar alpha = exp(-0.5) + pow($(V), 2.0) + 3;\n\
scalar beta = 1.5e-3 * sqrt(fabs($(V)));\n";

fn bench_ensure_ftype(c: &mut Criterion) {
    c.bench_function("ensure_ftype_single", |b| {
        b.iter(|| ensure_ftype(black_box(SIM_CODE), ScalarPrecision::Single))
    });
    c.bench_function("ensure_ftype_double", |b| {
        b.iter(|| ensure_ftype(black_box(SIM_CODE), ScalarPrecision::Double))
    });
}

fn bench_function_substitute(c: &mut Criterion) {
    c.bench_function("function_substitute_nested", |b| {
        b.iter(|| {
            let mut code = "$(addToInSyn, $(g) * exp(-($(t) - $(sT_pre)) / 10.0));".to_string();
            function_substitute(
                black_box(&mut code),
                "addToInSyn",
                1,
                "atomicAdd(&dd_inSynS[ipost], $(0))",
            )
            .unwrap();
            code
        })
    });
}

criterion_group!(benches, bench_ensure_ftype, bench_function_substitute);
criterion_main!(benches);
