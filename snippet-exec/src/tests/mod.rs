mod utils;

pub(crate) mod test_cases {
    pub const PYTHON_HELLO: &str = r#"print("Hello from Python!")"#;
    pub const PYTHON_WRITE_EXACT: &str = "import sys\nsys.stdout.write('exact text')";
    pub const PYTHON_RAISE: &str = "def boom():\n    raise ValueError('boom')\n\nboom()\n";
    pub const PYTHON_SYNTAX_ERROR: &str = "print('unterminated\n";
    pub const PYTHON_EXIT_CODE: &str = "import sys\nprint('leaving')\nsys.exit(3)\n";
    pub const PYTHON_INFINITE_LOOP: &str = "while True:\n    pass\n";
    pub const PYTHON_SLEEP_FOREVER: &str = "import time\ntime.sleep(3600)\n";
    pub const PYTHON_WITH_INPUT: &str = r#"
name = input("Name: ")
second = input()
print(f"Hello, {name}!")
print(f"second={second!r}")
"#;
    pub const PYTHON_READ_PAST_END: &str = r#"
value = input()
print(f"got={value!r}")
"#;
    pub const PYTHON_RESOURCE_HEAVY: &str = "block = bytearray(1024 * 1024 * 1024)\nprint(len(block))\n";
    pub const PYTHON_FLOOD: &str = "import sys\nsys.stdout.write('x' * (4 * 1024 * 1024))\n";
    pub const PYTHON_CWD: &str = "import os\nprint(os.getcwd())\n";
    pub const PYTHON_LEAK_GLOBAL: &str = "leaked = 42\nprint('set')\n";
    pub const PYTHON_READ_GLOBAL: &str = "print(globals().get('leaked', 'clean'))\n";
    pub const PYTHON_ESCAPED_CHILD: &str = r#"
import os, time
print("hello from parent", flush=True)
pid = os.fork()
if pid == 0:
    os.setsid()
    time.sleep(20)
    os._exit(0)
print(f"child={pid}", flush=True)
"#;
    pub const PYTHON_RAISE_MEMORY_ERROR: &str = "raise MemoryError('user raised')
";
    pub const PYTHON_KILL_SELF: &str = "import os, signal
print('bye', flush=True)
os.kill(os.getpid(), signal.SIGKILL)
";
    pub const PYTHON_BACKGROUND_CHILD: &str = r#"
import subprocess
subprocess.Popen(["sleep", "30"])
print("spawned")
"#;
}
