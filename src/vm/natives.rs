//! Host-provided native functions, keyed by fully-qualified name.
//!
//! A handler pops its arguments and pushes exactly one result (nil when it
//! has no natural return value). Handlers that produce strings append them
//! to the image's string pool; the pool is append-only so the new index is
//! stable.

use std::io;

use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::vm::value::Value;
use crate::vm::vm::{Vm, VmResult};

pub type NativeFn = fn(&mut Vm) -> VmResult<()>;

/// The built-in handler set registered at VM construction.
pub fn default_registry() -> IndexMap<String, NativeFn> {
    let mut natives: IndexMap<String, NativeFn> = IndexMap::new();

    natives.insert("Console.println".to_string(), console_println as NativeFn);
    natives.insert("Console.print".to_string(), console_print as NativeFn);

    natives.insert("System.command".to_string(), system_command as NativeFn);
    natives.insert("System.clear".to_string(), system_clear as NativeFn);
    natives.insert("System.pause".to_string(), system_pause as NativeFn);
    natives.insert("System.platform".to_string(), system_platform as NativeFn);
    natives.insert("System.env".to_string(), system_env as NativeFn);

    natives.insert("IO.input".to_string(), io_input as NativeFn);
    natives.insert("IO.toInt".to_string(), io_to_int as NativeFn);
    natives.insert("IO.toFloat".to_string(), io_to_float as NativeFn);

    natives.insert("Random.int".to_string(), random_int as NativeFn);

    natives
}

fn console_println(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let text = vm.stringify(value);
    vm.write_out(&text)?;
    vm.write_out("\n")?;
    vm.push(Value::Nil);
    Ok(())
}

fn console_print(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let text = vm.stringify(value);
    vm.write_out(&text)?;
    vm.flush_out()?;
    vm.push(Value::Nil);
    Ok(())
}

/// Run a shell command; the exit code is the result.
fn system_command(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let command = vm.stringify(value);

    #[cfg(windows)]
    let status = std::process::Command::new("cmd").arg("/C").arg(&command).status();
    #[cfg(not(windows))]
    let status = std::process::Command::new("sh").arg("-c").arg(&command).status();

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1) as i64,
        Err(_) => -1,
    };
    vm.push(Value::Int(code));
    Ok(())
}

fn system_clear(vm: &mut Vm) -> VmResult<()> {
    #[cfg(windows)]
    let _ = std::process::Command::new("cmd").arg("/C").arg("cls").status();
    #[cfg(not(windows))]
    let _ = std::process::Command::new("clear").status();

    vm.push(Value::Nil);
    Ok(())
}

fn system_pause(vm: &mut Vm) -> VmResult<()> {
    let message = vm.pop()?;
    let text = if matches!(message, Value::Nil) {
        "Press Enter to continue...".to_string()
    } else {
        vm.stringify(message)
    };
    vm.write_out(&text)?;
    vm.flush_out()?;

    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
    vm.push(Value::Nil);
    Ok(())
}

fn system_platform(vm: &mut Vm) -> VmResult<()> {
    let platform = if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    };
    let idx = vm.image_mut().push_string(platform);
    vm.push(Value::Str(idx));
    Ok(())
}

fn system_env(vm: &mut Vm) -> VmResult<()> {
    let name = vm.pop()?;
    let name = vm.stringify(name);
    match std::env::var(&name) {
        Ok(value) => {
            let idx = vm.image_mut().push_string(value);
            vm.push(Value::Str(idx));
        }
        Err(_) => vm.push(Value::Nil),
    }
    Ok(())
}

fn io_input(vm: &mut Vm) -> VmResult<()> {
    let prompt = vm.pop()?;
    if !matches!(prompt, Value::Nil) {
        let text = vm.stringify(prompt);
        vm.write_out(&text)?;
        vm.flush_out()?;
    }

    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }

    let idx = vm.image_mut().push_string(line);
    vm.push(Value::Str(idx));
    Ok(())
}

fn io_to_int(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let text = vm.stringify(value);
    match text.trim().parse::<i64>() {
        Ok(n) => {
            vm.push(Value::Int(n));
            Ok(())
        }
        Err(_) => Err(RuntimeError::general(
            "Failed to convert string to int",
            vm.pc(),
        )),
    }
}

fn io_to_float(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let text = vm.stringify(value);
    match text.trim().parse::<f64>() {
        Ok(n) => {
            vm.push(Value::Float(n));
            Ok(())
        }
        Err(_) => Err(RuntimeError::general(
            "Failed to convert string to float",
            vm.pc(),
        )),
    }
}

/// Deterministic pseudo-random int in [0, 100).
fn random_int(vm: &mut Vm) -> VmResult<()> {
    let n = vm.next_random();
    vm.push(Value::Int(n));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_the_documented_set() {
        let registry = default_registry();
        for name in [
            "Console.println",
            "Console.print",
            "System.command",
            "System.clear",
            "System.pause",
            "System.platform",
            "System.env",
            "IO.input",
            "IO.toInt",
            "IO.toFloat",
            "Random.int",
        ] {
            assert!(registry.contains_key(name), "missing native {}", name);
        }
    }
}
