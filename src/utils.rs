/// Utility functions: parameter reporting and logging setup
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use candle_nn::VarMap;

/// Calculate the number of trainable parameters in a parameter map
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// One `name: shape` line per parameter, sorted by name
pub fn describe_parameters(varmap: &VarMap) -> crate::Result<String> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| crate::TrainError::Training("parameter map lock poisoned".to_string()))?;

    let mut lines: Vec<String> = data
        .iter()
        .map(|(name, var)| format!("  {}: {:?}", name, var.dims()))
        .collect();
    lines.sort();
    Ok(lines.join("\n"))
}

/// Writes every record to stderr and to a log file
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Initialise env_logger (default level `info`) writing to stderr and `log_file`
///
/// The log file is truncated. `RUST_LOG` overrides the filter.
pub fn init_logging<P: AsRef<Path>>(log_file: P) -> crate::Result<()> {
    let file = File::create(log_file.as_ref())?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .try_init()
        .map_err(|e| crate::TrainError::Config(format!("logger already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn test_count_parameters() -> candle_core::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        candle_nn::linear(4, 3, vb.pp("fc"))?;

        // 4 * 3 weights + 3 biases
        assert_eq!(count_parameters(&varmap), 15);
        Ok(())
    }

    #[test]
    fn test_describe_parameters() -> crate::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        candle_nn::linear(4, 3, vb.pp("fc"))?;

        assert_eq!(describe_parameters(&varmap)?, "  fc.bias: [3]\n  fc.weight: [3, 4]");
        Ok(())
    }

    #[test]
    fn test_tee_writer_writes_file() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("stdout.log");
        let mut tee = TeeWriter {
            file: File::create(&path)?,
        };
        tee.write_all(b"epoch 0\n")?;
        tee.flush()?;

        assert_eq!(std::fs::read_to_string(&path)?, "epoch 0\n");
        Ok(())
    }
}
