// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use wasmrt::{
    Config, Environment, Error, FixedArena, Heap, Module, ModuleBuilder, NativeFrame, Result,
    Runtime,
};

fn nop(_frame: &mut NativeFrame<'_>) -> Result<()> {
    Ok(())
}

/// Pages sized to exactly what is asked for, so every link fills one.
fn tight_pages() -> Config {
    Config {
        code_page_align_bytes: 0,
        ..Config::default()
    }
}

fn load_fib(env: &Environment) -> Runtime {
    let mut runtime = Runtime::new(env, 4096).unwrap();
    runtime
        .load_module(Module::parse(env, &common::fib_wasm()).unwrap())
        .unwrap();
    runtime
}

#[test_log::test]
fn pages_return_to_the_environment() {
    let env = common::env();

    let mut runtime = load_fib(&env);
    runtime.find_function("fib").unwrap();
    assert_eq!(runtime.num_code_pages(), 1);
    assert_eq!(runtime.num_open_code_pages(), 1);
    assert_eq!(runtime.num_active_code_pages(), 0);
    drop(runtime);
    assert_eq!(env.num_released_code_pages(), 1);

    // the next runtime picks up the released page instead of allocating
    let mut runtime = load_fib(&env);
    runtime.find_function("fib").unwrap();
    assert_eq!(runtime.num_code_pages(), 1);
    assert_eq!(env.num_released_code_pages(), 0);
}

#[test]
fn links_share_an_open_page() {
    let env = common::env();
    let mut builder = ModuleBuilder::new(&env);
    for field in ["a", "b", "c"] {
        builder.import_function("env", field, "v()").unwrap();
    }

    let mut runtime = Runtime::new(&env, 1024).unwrap();
    let module = runtime.load_module(builder.build()).unwrap();
    for field in ["a", "b", "c"] {
        runtime
            .link_raw_function(module, "env", field, "v()", nop)
            .unwrap();
    }

    assert_eq!(runtime.num_code_pages(), 1);
    assert_eq!(runtime.num_open_code_pages(), 1);
}

#[test]
fn heap_is_released_with_the_environment() {
    let heap = Arc::new(FixedArena::new(1 << 20));
    let env = Environment::builder()
        .heap(heap.clone())
        .compiler(common::TestCompiler)
        .executor(common::TestExecutor)
        .build();

    let mut runtime = load_fib(&env);
    runtime.grow_memory(1).unwrap();
    runtime.find_function("fib").unwrap();
    assert!(heap.in_use() > 0);

    drop(runtime);
    // pooled pages are still reserved
    assert!(heap.in_use() > 0);
    drop(env);
    assert_eq!(heap.in_use(), 0);
}

#[test]
fn exhausted_heap_fails_compilation() {
    let heap = Arc::new(FixedArena::new(1024));
    let env = Environment::builder()
        .heap(heap)
        .compiler(common::TestCompiler)
        .executor(common::TestExecutor)
        .build();

    let mut runtime = load_fib(&env);
    assert_eq!(
        runtime.find_function("fib"),
        Err(Error::MallocFailedCodePage)
    );
    assert_eq!(runtime.num_code_pages(), 0);
}

proptest! {
    #[test]
    fn page_accounting(num_imports in 1usize..24, pooled in any::<bool>()) {
        let env = common::env_with(tight_pages());

        if pooled {
            // leave some pages in the pool for the runtime under test
            let mut warmup = Runtime::new(&env, 64).unwrap();
            link_all(&mut warmup, &env, num_imports / 2);
        }
        let pooled_before = env.num_released_code_pages();

        let mut runtime = Runtime::new(&env, 64).unwrap();
        link_all(&mut runtime, &env, num_imports);

        // each link fills a page sized to the call-native sequence
        prop_assert_eq!(runtime.num_code_pages(), num_imports);
        prop_assert_eq!(runtime.num_full_code_pages(), num_imports);
        prop_assert_eq!(
            runtime.num_open_code_pages()
                + runtime.num_full_code_pages()
                + runtime.num_active_code_pages(),
            runtime.num_code_pages()
        );
        prop_assert_eq!(
            env.num_released_code_pages(),
            pooled_before.saturating_sub(num_imports)
        );

        drop(runtime);
        prop_assert_eq!(
            env.num_released_code_pages(),
            pooled_before.max(num_imports)
        );
    }
}

fn link_all(runtime: &mut Runtime, env: &Environment, num_imports: usize) {
    let fields: Vec<String> = (0..num_imports).map(|i| format!("f{i}")).collect();

    let mut builder = ModuleBuilder::new(env);
    for field in &fields {
        builder.import_function("env", field, "v()").unwrap();
    }
    let module = runtime.load_module(builder.build()).unwrap();
    for field in &fields {
        runtime
            .link_raw_function(module, "env", field, "v()", nop)
            .unwrap();
    }
}
