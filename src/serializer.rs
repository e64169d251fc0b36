// Binary save/load of a finalized policy (spec §6).
//
// The on-disk layout is a fixed header, a string pool, then one
// section per table (targets, factvars, dresvars, methods), written
// and read with explicit network byte order via `byteorder`. Strings
// are interned once into a flat pool and referenced everywhere else
// by their position in it — a safe stand-in for the original's raw
// byte-offset pool addressing, since nothing here reconstructs
// pointers into a single allocation the way the original's loader does.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use thiserror::Error;

use crate::ident::Id;
use crate::instr::{opcode_byte, BranchMode, Chunk, CmpOp, GetMode, Instr, PopMode, PushArg, RelOp, SetMode};
use crate::value::Value;
use crate::vars::{Target, Universe, VarFlags};

const MAGIC: [u8; 4] = *b"DRES";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a DRES policy file (bad magic)")]
    BadMagic,
    #[error("unsupported policy file version {0}")]
    BadVersion(u32),
    #[error("string pool reference {0} out of range")]
    BadStringRef(u32),
    #[error("unknown opcode byte {0}")]
    UnknownOpcode(u8),
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown identifier kind {0}")]
    UnknownKind(u8),
}

type Result<T> = std::result::Result<T, SerializeError>;

/// A flat, append-only, dedup-by-content string table built while
/// walking the policy for `save`.
#[derive(Default)]
struct PoolWriter {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl PoolWriter {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BE>(self.strings.len() as u32)?;
        for s in &self.strings {
            let bytes = s.as_bytes();
            w.write_u32::<BE>(bytes.len() as u32)?;
            w.write_all(bytes)?;
        }
        Ok(())
    }
}

/// The pool as read back by `load`: a plain indexable `Vec<Rc<str>>`,
/// shared so every `Chunk`'s `Rc<str>` payloads can borrow from it
/// without re-allocating per reference.
struct PoolReader {
    strings: Vec<Rc<str>>,
}

impl PoolReader {
    fn read_from<R: Read>(r: &mut R) -> Result<PoolReader> {
        let n = r.read_u32::<BE>()? as usize;
        let mut strings = Vec::with_capacity(n);
        for _ in 0..n {
            let len = r.read_u32::<BE>()? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            let s = String::from_utf8_lossy(&buf).into_owned();
            strings.push(Rc::from(s.as_str()));
        }
        Ok(PoolReader { strings })
    }

    fn get(&self, idx: u32) -> Result<Rc<str>> {
        self.strings
            .get(idx as usize)
            .cloned()
            .ok_or(SerializeError::BadStringRef(idx))
    }
}

fn write_id<W: Write>(w: &mut W, id: Id) -> Result<()> {
    w.write_u32::<BE>(id.to_bits())?;
    Ok(())
}

fn read_id<R: Read>(r: &mut R) -> Result<Id> {
    Ok(Id::from_bits(r.read_u32::<BE>()?))
}

fn write_value<W: Write>(w: &mut W, pool: &mut PoolWriter, v: &Value) -> Result<()> {
    match v {
        Value::Nil => w.write_u8(0)?,
        Value::Integer(n) => {
            w.write_u8(1)?;
            w.write_i32::<BE>(*n)?;
        }
        Value::Double(d) => {
            w.write_u8(2)?;
            w.write_f64::<BE>(*d)?;
        }
        Value::Str(s) => {
            w.write_u8(3)?;
            w.write_u32::<BE>(pool.intern(s))?;
        }
        // A dresvar's persisted value is always a scalar; a `Global`
        // factset is transient VM state and never escapes a chunk.
        Value::Global(_) => w.write_u8(0)?,
    }
    Ok(())
}

fn read_value<R: Read>(r: &mut R, pool: &PoolReader) -> Result<Value> {
    let tag = r.read_u8()?;
    Ok(match tag {
        0 => Value::Nil,
        1 => Value::Integer(r.read_i32::<BE>()?),
        2 => Value::Double(r.read_f64::<BE>()?),
        3 => {
            let idx = r.read_u32::<BE>()?;
            Value::Str(pool.get(idx)?)
        }
        other => return Err(SerializeError::UnknownValueTag(other)),
    })
}

fn write_instr<W: Write>(w: &mut W, pool: &mut PoolWriter, instr: &Instr) -> Result<()> {
    match instr {
        Instr::Push(arg) => {
            w.write_u8(opcode_byte::PUSH)?;
            match arg {
                PushArg::Integer(n) => {
                    w.write_u8(0)?;
                    w.write_i32::<BE>(*n)?;
                }
                PushArg::Double(d) => {
                    w.write_u8(1)?;
                    w.write_f64::<BE>(*d)?;
                }
                PushArg::Str(s) => {
                    w.write_u8(2)?;
                    w.write_u32::<BE>(pool.intern(s))?;
                }
                PushArg::Global(s) => {
                    w.write_u8(3)?;
                    w.write_u32::<BE>(pool.intern(s))?;
                }
                PushArg::Local(n) => {
                    w.write_u8(5)?;
                    w.write_u16::<BE>(*n)?;
                }
                PushArg::DresVar(idx) => {
                    w.write_u8(6)?;
                    w.write_u32::<BE>(*idx)?;
                }
            }
        }
        Instr::Pop(mode) => {
            w.write_u8(opcode_byte::POP)?;
            w.write_u8(match mode {
                PopMode::Locals => 0,
                PopMode::Discard => 1,
            })?;
        }
        Instr::Filter(n) => {
            w.write_u8(opcode_byte::FILTER)?;
            w.write_u8(*n)?;
        }
        Instr::Update(n, partial) => {
            w.write_u8(opcode_byte::UPDATE)?;
            w.write_u8(*n)?;
            w.write_u8(*partial as u8)?;
        }
        Instr::Create(n) => {
            w.write_u8(opcode_byte::CREATE)?;
            w.write_u8(*n)?;
        }
        Instr::Set(mode) => {
            w.write_u8(opcode_byte::SET)?;
            match mode {
                SetMode::Plain => w.write_u8(0)?,
                SetMode::Field => w.write_u8(1)?,
                SetMode::Local(n) => {
                    w.write_u8(2)?;
                    w.write_u16::<BE>(*n)?;
                }
                SetMode::DresVar(idx) => {
                    w.write_u8(3)?;
                    w.write_u32::<BE>(*idx)?;
                }
            }
        }
        Instr::Get(mode) => {
            w.write_u8(opcode_byte::GET)?;
            match mode {
                GetMode::Field => w.write_u8(0)?,
                GetMode::Local(n) => {
                    w.write_u8(1)?;
                    w.write_u16::<BE>(*n)?;
                }
                GetMode::DresVar(idx) => {
                    w.write_u8(2)?;
                    w.write_u32::<BE>(*idx)?;
                }
            }
        }
        Instr::Call(narg) => {
            w.write_u8(opcode_byte::CALL)?;
            w.write_u8(*narg)?;
        }
        Instr::Cmp(op) => {
            w.write_u8(opcode_byte::CMP)?;
            match op {
                CmpOp::Rel(rel) => {
                    w.write_u8(0)?;
                    w.write_u8(rel.to_tag())?;
                }
                CmpOp::Not => w.write_u8(1)?,
            }
        }
        Instr::Branch(mode, disp) => {
            w.write_u8(opcode_byte::BRANCH)?;
            w.write_u8(match mode {
                BranchMode::Unconditional => 0,
                BranchMode::IfTrue => 1,
                BranchMode::IfFalse => 2,
            })?;
            w.write_i32::<BE>(*disp)?;
        }
        Instr::Debug(text) => {
            w.write_u8(opcode_byte::DEBUG)?;
            w.write_u32::<BE>(pool.intern(text))?;
        }
        Instr::Halt => w.write_u8(opcode_byte::HALT)?,
    }
    Ok(())
}

fn read_instr<R: Read>(r: &mut R, pool: &PoolReader) -> Result<Instr> {
    let op = r.read_u8()?;
    Ok(match op {
        opcode_byte::PUSH => {
            let tag = r.read_u8()?;
            Instr::Push(match tag {
                0 => PushArg::Integer(r.read_i32::<BE>()?),
                1 => PushArg::Double(r.read_f64::<BE>()?),
                2 => PushArg::Str(pool.get(r.read_u32::<BE>()?)?),
                3 => PushArg::Global(pool.get(r.read_u32::<BE>()?)?),
                // tag 4 was PushArg::Name, retired; 5/6 keep their tags
                // so old chunks that never used it stay readable.
                5 => PushArg::Local(r.read_u16::<BE>()?),
                6 => PushArg::DresVar(r.read_u32::<BE>()?),
                other => return Err(SerializeError::UnknownOpcode(other)),
            })
        }
        opcode_byte::POP => Instr::Pop(match r.read_u8()? {
            0 => PopMode::Locals,
            _ => PopMode::Discard,
        }),
        opcode_byte::FILTER => Instr::Filter(r.read_u8()?),
        opcode_byte::UPDATE => {
            let n = r.read_u8()?;
            let partial = r.read_u8()? != 0;
            Instr::Update(n, partial)
        }
        opcode_byte::CREATE => Instr::Create(r.read_u8()?),
        opcode_byte::SET => {
            let tag = r.read_u8()?;
            Instr::Set(match tag {
                0 => SetMode::Plain,
                1 => SetMode::Field,
                2 => SetMode::Local(r.read_u16::<BE>()?),
                3 => SetMode::DresVar(r.read_u32::<BE>()?),
                other => return Err(SerializeError::UnknownOpcode(other)),
            })
        }
        opcode_byte::GET => {
            let tag = r.read_u8()?;
            Instr::Get(match tag {
                0 => GetMode::Field,
                1 => GetMode::Local(r.read_u16::<BE>()?),
                2 => GetMode::DresVar(r.read_u32::<BE>()?),
                other => return Err(SerializeError::UnknownOpcode(other)),
            })
        }
        opcode_byte::CALL => Instr::Call(r.read_u8()?),
        opcode_byte::CMP => {
            let tag = r.read_u8()?;
            Instr::Cmp(match tag {
                0 => CmpOp::Rel(RelOp::from_tag(r.read_u8()?).ok_or(SerializeError::UnknownOpcode(0))?),
                _ => CmpOp::Not,
            })
        }
        opcode_byte::BRANCH => {
            let tag = r.read_u8()?;
            let disp = r.read_i32::<BE>()?;
            let mode = match tag {
                0 => BranchMode::Unconditional,
                1 => BranchMode::IfTrue,
                _ => BranchMode::IfFalse,
            };
            Instr::Branch(mode, disp)
        }
        opcode_byte::DEBUG => Instr::Debug(pool.get(r.read_u32::<BE>()?)?),
        opcode_byte::HALT => Instr::Halt,
        other => return Err(SerializeError::UnknownOpcode(other)),
    })
}

fn write_chunk<W: Write>(w: &mut W, pool: &mut PoolWriter, chunk: &Chunk) -> Result<()> {
    w.write_u32::<BE>(chunk.instrs.len() as u32)?;
    for instr in &chunk.instrs {
        write_instr(w, pool, instr)?;
    }
    Ok(())
}

fn read_chunk<R: Read>(r: &mut R, pool: &PoolReader) -> Result<Chunk> {
    let n = r.read_u32::<BE>()? as usize;
    let mut chunk = Chunk::new();
    for _ in 0..n {
        chunk.push(read_instr(r, pool)?);
    }
    Ok(chunk)
}

fn write_ids<W: Write>(w: &mut W, ids: &[Id]) -> Result<()> {
    w.write_u32::<BE>(ids.len() as u32)?;
    for &id in ids {
        write_id(w, id)?;
    }
    Ok(())
}

fn read_ids<R: Read>(r: &mut R) -> Result<Vec<Id>> {
    let n = r.read_u32::<BE>()? as usize;
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        ids.push(read_id(r)?);
    }
    Ok(ids)
}

/// Write a finalized policy's tables (spec §6 `save`). Targets whose
/// dependency order has not yet been computed are saved with an empty
/// order; `load` leaves finalizing a loaded policy to its caller.
pub fn save<W: Write>(w: &mut W, universe: &Universe) -> Result<()> {
    let mut pool = PoolWriter::default();

    let mut target_names = Vec::with_capacity(universe.ntarget());
    for t in universe.targets() {
        target_names.push(pool.intern(&t.name));
    }
    let mut factvar_names = Vec::with_capacity(universe.nfactvar());
    let mut factvar_flags = Vec::with_capacity(universe.nfactvar());
    for v in universe.factvars() {
        factvar_names.push(pool.intern(&v.name));
        factvar_flags.push(v.flags);
    }
    let mut dresvar_names = Vec::with_capacity(universe.ndresvar());
    let mut dresvar_flags = Vec::with_capacity(universe.ndresvar());
    let mut dresvar_values = Vec::with_capacity(universe.ndresvar());
    for v in universe.dresvars() {
        dresvar_names.push(pool.intern(&v.name));
        dresvar_flags.push(v.flags);
        dresvar_values.push(universe.dresvar_value(v.id));
    }

    // Buffer the data section so the pool (whose final contents depend
    // on every name and chunk literal interned while writing it) can
    // be written first, matching the pool-before-sections file layout.
    let mut body: Vec<u8> = Vec::new();
    body.write_u32::<BE>(universe.ntarget() as u32)?;
    for (t, &name_idx) in universe.targets().iter().zip(&target_names) {
        body.write_u32::<BE>(name_idx)?;
        write_ids(&mut body, &t.prereqs)?;
        write_chunk(&mut body, &mut pool, &t.code)?;
        write_ids(&mut body, &t.dependencies())?;
    }

    body.write_u32::<BE>(universe.nfactvar() as u32)?;
    for (&name_idx, flags) in factvar_names.iter().zip(&factvar_flags) {
        body.write_u32::<BE>(name_idx)?;
        body.write_u8(flags.is_prereq as u8)?;
    }

    body.write_u32::<BE>(universe.ndresvar() as u32)?;
    for ((&name_idx, flags), value) in dresvar_names.iter().zip(&dresvar_flags).zip(&dresvar_values) {
        body.write_u32::<BE>(name_idx)?;
        body.write_u8(flags.is_prereq as u8)?;
        write_value(&mut body, &mut pool, value)?;
    }

    w.write_all(&MAGIC)?;
    w.write_u32::<BE>(VERSION)?;
    pool.write_to(w)?;
    w.write_all(&body)?;
    Ok(())
}

/// Read a saved policy back into a fresh `Universe` (spec §6 `load`).
/// The loader reconstructs each table by declaring names in the same
/// order they were saved, so ids are stable across a round-trip.
pub fn load<R: Read>(r: &mut R) -> Result<Universe> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let version = r.read_u32::<BE>()?;
    if version != VERSION {
        return Err(SerializeError::BadVersion(version));
    }

    let pool = PoolReader::read_from(r)?;
    let mut universe = Universe::new();

    let ntarget = r.read_u32::<BE>()? as usize;
    let mut pending: Vec<(Id, Vec<Id>, Chunk, Vec<Id>)> = Vec::with_capacity(ntarget);
    for _ in 0..ntarget {
        let name = pool.get(r.read_u32::<BE>()?)?;
        let id = universe.declare_target(&name);
        let prereqs = read_ids(r)?;
        let code = read_chunk(r, &pool)?;
        let deps = read_ids(r)?;
        pending.push((id, prereqs, code, deps));
    }
    for (id, prereqs, code, deps) in pending {
        let target: &mut Target = universe.target_mut(id);
        target.prereqs = prereqs;
        target.code = code;
        target.set_dependencies(deps);
    }

    let nfactvar = r.read_u32::<BE>()? as usize;
    for _ in 0..nfactvar {
        let name = pool.get(r.read_u32::<BE>()?)?;
        let is_prereq = r.read_u8()? != 0;
        let id = universe.declare_factvar(&name);
        universe.factvar_mut(id).flags = VarFlags { is_prereq };
    }

    let ndresvar = r.read_u32::<BE>()? as usize;
    for _ in 0..ndresvar {
        let name = pool.get(r.read_u32::<BE>()?)?;
        let is_prereq = r.read_u8()? != 0;
        let value = read_value(r, &pool)?;
        let id = universe.declare_dresvar(&name);
        universe.dresvar_mut(id).flags = VarFlags { is_prereq };
        universe.set_dresvar_value(id, value);
    }

    Ok(universe)
}

/// Sniff whether `bytes` looks like a compiled policy image, for
/// `Policy::open`'s magic/suffix autodetection (spec §6).
pub fn looks_precompiled(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::PushArg;

    fn sample_universe() -> Universe {
        let mut u = Universe::new();
        let leaf = u.declare_target("leaf");
        let mut leaf_chunk = Chunk::new();
        leaf_chunk.push(Instr::Push(PushArg::Integer(1)));
        leaf_chunk.push(Instr::Halt);
        u.target_mut(leaf).code = leaf_chunk;

        let goal = u.declare_target("goal");
        u.target_mut(goal).prereqs.push(leaf);
        let mut goal_chunk = Chunk::new();
        goal_chunk.push(Instr::Push(PushArg::Str(Rc::from("hello"))));
        goal_chunk.push(Instr::Pop(PopMode::Discard));
        goal_chunk.push(Instr::Push(PushArg::Integer(1)));
        goal_chunk.push(Instr::Halt);
        u.target_mut(goal).code = goal_chunk;
        u.target_mut(goal).set_dependencies(vec![leaf, goal]);

        let fv = u.declare_factvar("sys.load");
        u.factvar_mut(fv).flags.is_prereq = true;

        let dv = u.declare_dresvar("count");
        u.set_dresvar_value(dv, Value::Integer(7));

        u
    }

    #[test]
    fn round_trips_targets_variables_and_bytecode() {
        let universe = sample_universe();
        let mut buf = Vec::new();
        save(&mut buf, &universe).unwrap();

        let loaded = load(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(loaded.ntarget(), universe.ntarget());
        assert_eq!(loaded.nfactvar(), universe.nfactvar());
        assert_eq!(loaded.ndresvar(), universe.ndresvar());

        let goal = loaded.target_by_name("goal").unwrap();
        assert_eq!(loaded.target(goal).unwrap().prereqs.len(), 1);
        assert_eq!(loaded.target(goal).unwrap().code.instrs.len(), 4);
        assert_eq!(loaded.target(goal).unwrap().dependencies().len(), 2);

        let fv = loaded.factvar_by_name("sys.load").unwrap();
        assert!(loaded.factvar(fv).unwrap().flags.is_prereq);

        let dv = loaded.dresvar_by_name("count").unwrap();
        match loaded.dresvar_value(dv) {
            Value::Integer(7) => {}
            other => panic!("expected Integer(7), got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 16];
        assert!(matches!(load(&mut std::io::Cursor::new(buf)), Err(SerializeError::BadMagic)));
    }

    #[test]
    fn looks_precompiled_checks_magic_prefix() {
        assert!(looks_precompiled(b"DRES\x00\x00\x00\x01"));
        assert!(!looks_precompiled(b"target goal {}"));
    }
}
