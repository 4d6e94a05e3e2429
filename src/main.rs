use {
  monoprof::{FrameMetadata, ManualRuntime, Profiler},
  std::error::Error,
  tracing_subscriber::EnvFilter,
};

fn main() -> Result<(), Box<dyn Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("monoprof=info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let profiler = Profiler::builder().backend(ManualRuntime::new()).finish();
  profiler.init("demo-runtime")?;
  profiler.resume()?;

  let sink = profiler.sink();
  for frame in ["Game.Update", "Spawner.Tick", "Enemy.Create"] {
    sink.method_enter(FrameMetadata::parse(frame));
  }
  for _ in 0..4 {
    sink.allocation("Enemy", 96);
  }
  sink.allocation("System.String", 42);
  sink.method_leave();
  sink.allocation("Vector3[]", 240);
  sink.method_leave();
  sink.method_leave();

  profiler.pause()?;
  let snapshot = profiler.snapshot()?;

  println!("=== demo snapshot ===");
  let mut methods = snapshot.methods();
  while let Ok(method) = methods.current() {
    println!(
      "{} total={}B delta={}B stack={}",
      method.name, method.total_bytes, method.delta_bytes, method.stack
    );
    for ty in method.objects() {
      println!("  {} {}B", ty.name, ty.bytes);
    }
    methods.advance();
  }
  println!("unattributed events: {}", snapshot.unattributed_events());

  let path = std::env::temp_dir().join("monoprof-demo.xml");
  profiler.dump(&path, true)?;
  println!("dump written to {}", path.display());

  profiler.shutdown()?;
  Ok(())
}
