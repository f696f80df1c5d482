//! The error taxonomy for the jail orchestrator.
//!

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
        Proxy(::jail_proxy::Error, ::jail_proxy::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        Yaml(::serde_yaml::Error);
    }

    errors {
        /// The requested command name is not registered.
        NotConfigured(name: String) {
            description("command not configured")
            display("command not configured: {:?}", name)
        }

        /// The command has no driver template, so `evaluate` cannot be used.
        NotSupportedForEvaluate(name: String) {
            description("command does not support evaluate mode")
            display("command does not support evaluate mode: {:?}", name)
        }

        /// The child exited nonzero or was killed by a signal.
        ExecutionFailed(status: i32, stdout: Vec<u8>, stderr: Vec<u8>) {
            description("execution failed")
            display(
                "execution failed with status {}: stdout={:?} stderr={:?}",
                status,
                String::from_utf8_lossy(stdout),
                String::from_utf8_lossy(stderr),
            )
        }

        /// The evaluate driver's output was not a single JSON object.
        ProtocolError(raw_output: Vec<u8>) {
            description("evaluate mode produced invalid output")
            display("evaluate mode produced invalid output: {:?}", String::from_utf8_lossy(raw_output))
        }

        /// An extra file name or a copied file's basename contains a path
        /// separator.
        InvalidFileName(name: String) {
            description("file name must be flat")
            display("file name must not contain a path separator: {:?}", name)
        }
    }
}
