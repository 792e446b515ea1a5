use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;

use extbridge::backend::loader::ExtensionLoader;
use extbridge::vm::{Object, Vm};
use extbridge::{BridgeConfig, BridgeContext};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <library> <module>", args[0]);
        return ExitCode::FAILURE;
    }
    let (library, module_name) = (&args[1], &args[2]);

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let trace = config.trace_upcalls;
    let debug = config.debug_handles;

    let vm = Rc::new(Vm::new());
    let ctx = BridgeContext::new(vm.clone(), config);
    let mut loader = ExtensionLoader::new();

    println!("Loading {} from {}...", module_name, library);
    let module = match loader.load(&ctx, Path::new(library), module_name) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("Loading failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Object::Module(m) = &*module {
        println!("Module {}", m.name);
        for (name, value) in m.attrs.borrow().iter() {
            println!("  {:<24} {}", name, vm.type_name(value));
        }
    }

    if debug {
        for leak in ctx.debug_leaks() {
            eprintln!("Leaked handle {} (from {})", leak.handle, leak.origin);
        }
    }
    if trace {
        match ctx.upcall_stats_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to export upcall stats: {}", e),
        }
    }
    ExitCode::SUCCESS
}
